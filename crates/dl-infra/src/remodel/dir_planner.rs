//! Remodel planning against a directory of snap files.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use dl_core::model::ModelAssertion;
use dl_core::ports::{PlannerError, RemodelContext, RemodelPlannerPort};
use dl_core::seed::SnapKind;
use dl_core::snap::SnapSetup;

/// Offers the snaps found in a directory, named `<name>_<revision>.snap`,
/// to remodels. For each snap the new model requires, the highest revision
/// on offer is used unless that revision is already installed.
pub struct DirRemodelPlanner {
    dir: PathBuf,
}

impl DirRemodelPlanner {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Highest revision of each snap in the directory.
    async fn offered(&self) -> Result<BTreeMap<String, (String, PathBuf)>, PlannerError> {
        let io = |e: std::io::Error| PlannerError::Failed(format!("cannot read {}: {e}", self.dir.display()));
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(io(e)),
        };
        let mut offered: BTreeMap<String, (String, PathBuf)> = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await.map_err(io)? {
            let file_name = entry.file_name();
            let Some((name, revision)) = file_name
                .to_str()
                .and_then(|n| n.strip_suffix(".snap"))
                .and_then(|n| n.rsplit_once('_'))
            else {
                continue;
            };
            let newer = offered
                .get(name)
                .map(|(current, _)| revision_key(revision) > revision_key(current))
                .unwrap_or(true);
            if newer {
                offered.insert(name.to_string(), (revision.to_string(), entry.path()));
            }
        }
        Ok(offered)
    }
}

/// Numeric revisions sort numerically, anything else after them.
fn revision_key(revision: &str) -> (u64, String) {
    match revision.parse::<u64>() {
        Ok(n) => (n, String::new()),
        Err(_) => (u64::MAX, revision.to_string()),
    }
}

fn snap_kind(model: &ModelAssertion, name: &str) -> Option<SnapKind> {
    if model.base.as_deref() == Some(name) {
        Some(SnapKind::Base)
    } else if model.kernel.as_deref() == Some(name) {
        Some(SnapKind::Kernel)
    } else if model.gadget.as_deref() == Some(name) {
        Some(SnapKind::Gadget)
    } else if name == "snapd" {
        Some(SnapKind::Snapd)
    } else {
        None
    }
}

#[async_trait]
impl RemodelPlannerPort for DirRemodelPlanner {
    async fn plan(&self, ctx: &RemodelContext) -> Result<Vec<SnapSetup>, PlannerError> {
        let offered = self.offered().await?;
        let mut plan = Vec::new();
        for name in ctx.new_model.all_required_snaps() {
            let installed = ctx.installed.get(&name);
            let Some((revision, path)) = offered.get(&name) else {
                if installed.is_some() {
                    continue;
                }
                return Err(PlannerError::MissingSnap(name));
            };
            if installed.map(|s| &s.revision == revision).unwrap_or(false) {
                continue;
            }
            let kind = snap_kind(&ctx.new_model, &name)
                .or_else(|| installed.map(|s| s.kind))
                .unwrap_or_default();
            debug!(snap = %name, revision = %revision, "planned for remodel");
            plan.push(SnapSetup {
                name,
                revision: revision.clone(),
                path: path.clone(),
                kind,
                required: true,
            });
        }
        Ok(plan)
    }
}
