pub mod apply;
pub mod plan;
pub mod state;

use anyhow::{Context as AnyhowContext, Result};
use declarative::{EngineContext, ExecuteOptions, FileStore, Providers, ResourceDecl};
use std::path::PathBuf;

use crate::Context;
use crate::declaration;
use crate::provider;
use crate::settings::Settings;

/// Everything a command needs to talk to the engine
pub struct Session {
    pub declarations_path: PathBuf,
    pub store: FileStore,
    pub providers: Providers,
    pub options: ExecuteOptions,
}

impl Session {
    /// Load settings, apply global flags, and open the state file
    pub fn open(ctx: &Context) -> Result<Self> {
        let settings = Settings::load()?;

        let declarations_path = ctx
            .file
            .clone()
            .unwrap_or_else(|| settings.declarations_path());
        let state_path = match &ctx.state {
            Some(path) => path.clone(),
            None => settings.state_path()?,
        };
        let provider_root = settings.provider_root()?;

        log::info!("Stack '{}', state {}", settings.stack, state_path.display());
        let store = FileStore::open(&state_path)
            .with_context(|| format!("Could not open state file: {}", state_path.display()))?;

        Ok(Self {
            declarations_path,
            store,
            providers: provider::registry(&provider_root),
            options: settings.execute_options(),
        })
    }

    pub fn declarations(&self) -> Result<Vec<ResourceDecl>> {
        declaration::load(&self.declarations_path).with_context(|| {
            format!(
                "Could not load declarations from {}",
                self.declarations_path.display()
            )
        })
    }

    pub fn engine(&self) -> EngineContext<'_> {
        EngineContext::new(&self.providers, &self.store, &self.options)
    }
}

#[cfg(test)]
mod tests {
    use crate::declaration;
    use crate::provider;
    use declarative::{
        AutoConfirm, EngineContext, ExecuteOptions, FileStore, NoProgress, Plan, StateStore,
        execute,
    };
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn test_sample_stack_converges_with_local_provider() {
        let dir = TempDir::new().unwrap();
        let decls =
            declaration::load(&Path::new(env!("CARGO_MANIFEST_DIR")).join("stacks/product.toml"))
                .unwrap();
        let providers = provider::registry(&dir.path().join("resources"));
        let store = FileStore::open(dir.path().join("state.json")).unwrap();
        let options = ExecuteOptions::default();
        let ctx = EngineContext::new(&providers, &store, &options);

        let plan = Plan::build(ctx, &decls).unwrap();
        let report = execute(ctx, plan, &mut NoProgress, &mut AutoConfirm).unwrap();
        assert!(report.is_success(), "{:?}", report.failures().collect::<Vec<_>>());
        assert_eq!(report.summary.created, decls.len());

        let deployment = store.get("api-deployment").unwrap().unwrap();
        let config_name = store.get("api-config").unwrap().unwrap().outputs["metadata"]["name"].clone();
        assert_eq!(deployment.inputs["metadata"]["namespace"], json!("product-ns-dev"));
        assert_eq!(
            deployment.inputs["spec"]["template"]["spec"]["containers"][1]["env"][1]["valueFrom"]
                ["configMapKeyRef"]["name"],
            config_name
        );

        let again = Plan::build(ctx, &decls).unwrap();
        assert!(!again.has_changes());

        let teardown = Plan::destroy(ctx).unwrap();
        let report = execute(ctx, teardown, &mut NoProgress, &mut AutoConfirm).unwrap();
        assert!(report.is_success());
        assert_eq!(report.summary.deleted, decls.len());
        assert!(store.list().unwrap().is_empty());
    }
}
