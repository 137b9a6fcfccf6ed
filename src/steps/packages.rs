//! `packages` steps: install the packages that are missing.

use crate::error::{ProvisionError, Result};
use crate::package_query::{is_valid_package_name, PackageQuery, PackageStatus};
use crate::step::InstallationStep;
use std::sync::Arc;
use tracing::info;

/// Step installing `packages` through `query`, skipping those already present
pub fn packages_step(
    name: &str,
    packages: Vec<String>,
    query: Arc<dyn PackageQuery>,
) -> Result<InstallationStep> {
    if packages.is_empty() {
        return Err(ProvisionError::config(format!(
            "step '{}': package list is empty",
            name
        )));
    }
    if let Some(bad) = packages.iter().find(|p| !is_valid_package_name(p)) {
        return Err(ProvisionError::config(format!(
            "step '{}': invalid package name {:?}",
            name, bad
        )));
    }
    let description = format!("install {}", packages.join(", "));

    Ok(InstallationStep::new(name, move |ctx| {
        let missing: Vec<String> = packages
            .iter()
            .filter(|p| query.status(p) != PackageStatus::Installed)
            .cloned()
            .collect();
        if missing.is_empty() {
            info!("All packages already installed: {}", packages.join(", "));
            return Ok(());
        }

        let label = format!("install {}", missing.join(" "));
        ctx.retry(&label, |_| query.install(&missing))?;
        Ok(())
    })
    .with_description(description))
}
