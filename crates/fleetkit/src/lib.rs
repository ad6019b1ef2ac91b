//! # Fleetkit
//!
//! Declarative reconciliation of cloud compute instances.
//!
//! A [`ResourceDeclaration`] describes a population of instances: what they
//! look like, how many there should be and which lifecycle phase they should
//! be in. [`reconcile`] runs one pass against a [`Provider`], converging the
//! live population and reporting what changed.
//!
//! ## Stages
//!
//! - **Matcher** ([`matcher`]): finds the live population by id or filter
//! - **Request builder** ([`builder`]): turns a declaration into a launch request
//! - **Diff engine** ([`diff`]): computes in-place changes per instance
//! - **Lifecycle** ([`lifecycle`]): drives instances to a phase, awaiting
//!   transitional states
//! - **Population** ([`population`]): grows or shrinks to an exact count
//! - **Retry** ([`retry`]): launches across alternate instance types
//!
//! ## Example
//!
//! ```
//! use fleetkit::{
//!     InstanceAttributes, LifecycleTarget, MemoryProvider, ReconcileContext,
//!     ResourceDeclaration, reconcile,
//! };
//!
//! let cloud = MemoryProvider::with_default_network();
//! let declaration = ResourceDeclaration::new(LifecycleTarget::Present).with_attributes(
//!     InstanceAttributes {
//!         name: Some("web".into()),
//!         image_id: Some("ami-1".into()),
//!         instance_type: Some("t3.micro".into()),
//!         ..Default::default()
//!     },
//! );
//!
//! let result = reconcile(&cloud, &declaration, &ReconcileContext::new(true))?;
//! assert!(result.changed);
//! assert_eq!(result.creation.map(|r| r.count), Some(1));
//! # Ok::<(), fleetkit::Error>(())
//! ```

pub mod builder;
pub mod context;
pub mod declaration;
pub mod diff;
pub mod error;
pub mod lifecycle;
pub mod matcher;
pub mod memory;
pub mod modify;
pub mod population;
pub mod provider;
pub mod reconciler;
pub mod retry;
pub mod types;

pub use builder::{CreationRequest, InterfaceRequest};
pub use context::{EngineSettings, NoObserver, Observer, ReconcileContext};
pub use declaration::{
    DeclarationDocument, InstanceAttributes, Population, ResourceDeclaration, WaitPolicy,
};
pub use diff::{AttributeChange, Change, ChangeSet, TagChange};
pub use error::{Error, ErrorCategory, Result};
pub use lifecycle::TransitionReport;
pub use matcher::{MatchFilter, Selector};
pub use memory::MemoryProvider;
pub use provider::{Provider, WaitConfig, WaitStatus};
pub use reconciler::{ReconciliationResult, reconcile};
pub use retry::LaunchReport;
pub use types::{InstanceState, LifecycleTarget, LiveInstance, WaitCondition};
