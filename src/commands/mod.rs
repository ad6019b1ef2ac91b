pub mod apply;
pub mod plan;
pub mod render;
pub mod status;

use anyhow::{Context as AnyhowContext, Result};
use fleetkit::{MemoryProvider, ResourceDeclaration};
use std::path::PathBuf;

use crate::cli::TargetArgs;
use crate::config::{self, Settings};

/// Everything a command needs: settings, the declaration and the cloud it targets
pub struct Session {
    pub settings: Settings,
    pub declaration: ResourceDeclaration,
    pub cloud: MemoryProvider,
    pub cloud_path: PathBuf,
}

impl Session {
    pub fn open(args: &TargetArgs) -> Result<Self> {
        let settings = Settings::load()?;
        let declaration = config::load_declaration(&args.declaration)?;
        let cloud_path = settings.cloud_path(args.cloud.as_deref())?;
        log::debug!("Using cloud at {}", cloud_path.display());
        let cloud = MemoryProvider::load(&cloud_path)
            .with_context(|| format!("Could not load cloud from {}", cloud_path.display()))?;

        Ok(Self {
            settings,
            declaration,
            cloud,
            cloud_path,
        })
    }

    pub fn save(&self) -> Result<()> {
        self.cloud
            .save(&self.cloud_path)
            .with_context(|| format!("Could not save cloud to {}", self.cloud_path.display()))
    }
}
