use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::model::{ReloadCapability, ServerInstance};

/// Token in a start command that the supervisor replaces with the resolved
/// JVM executable.
pub const JAVA_PLACEHOLDER: &str = "{java}";

/// Framework-specific knowledge the supervisor and deploy pipeline consume.
#[async_trait]
pub trait FrameworkProvider: Send + Sync {
    fn name(&self) -> &str;

    /// argv for launching the server; may contain [`JAVA_PLACEHOLDER`].
    fn start_command(&self, instance: &ServerInstance) -> Vec<String>;

    fn stop_command(&self) -> String;

    fn reload_command(&self) -> Option<String>;

    fn reload_capability(&self) -> ReloadCapability;

    /// Globs, relative to a project root, whose changes should trigger a
    /// rebuild.
    fn watch_patterns(&self) -> Vec<String>;

    /// Installs a built artifact into the server and returns where it landed.
    async fn deploy(&self, artifact: &Path, instance: &ServerInstance) -> anyhow::Result<PathBuf>;
}

/// A provider for frameworks that run as `java -jar <server.jar> nogui` and
/// load code from a directory under the server root.
#[derive(Debug, Clone)]
pub struct JarProvider {
    pub name: String,
    pub stop: String,
    pub reload: Option<String>,
    pub capability: ReloadCapability,
    pub deploy_dir: PathBuf,
    pub patterns: Vec<String>,
}

impl JarProvider {
    pub fn vanilla() -> Self {
        Self {
            name: "vanilla".into(),
            stop: "stop".into(),
            reload: Some("reload".into()),
            capability: ReloadCapability::Warm,
            deploy_dir: PathBuf::from("world/datapacks"),
            patterns: vec!["data/**/*.json".into(), "data/**/*.mcfunction".into()],
        }
    }

    pub fn paper() -> Self {
        Self {
            name: "paper".into(),
            stop: "stop".into(),
            reload: Some("reload confirm".into()),
            capability: ReloadCapability::Warm,
            deploy_dir: PathBuf::from("plugins"),
            patterns: vec![
                "src/**/*.java".into(),
                "src/**/*.kt".into(),
                "src/main/resources/**".into(),
            ],
        }
    }

    pub fn fabric() -> Self {
        Self {
            name: "fabric".into(),
            stop: "stop".into(),
            reload: None,
            capability: ReloadCapability::Cold,
            deploy_dir: PathBuf::from("mods"),
            patterns: vec!["src/**/*.java".into(), "src/main/resources/**".into()],
        }
    }

    pub fn forge() -> Self {
        Self {
            name: "forge".into(),
            ..Self::fabric()
        }
    }

    /// Skript scripts on a Paper server: copied as-is and hot reloaded.
    pub fn skript() -> Self {
        Self {
            name: "skript".into(),
            stop: "stop".into(),
            reload: Some("sk reload all".into()),
            capability: ReloadCapability::Hot,
            deploy_dir: PathBuf::from("plugins/Skript/scripts"),
            patterns: vec!["**/*.sk".into()],
        }
    }
}

#[async_trait]
impl FrameworkProvider for JarProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_command(&self, instance: &ServerInstance) -> Vec<String> {
        let mut argv = vec![JAVA_PLACEHOLDER.to_string()];
        argv.extend(instance.jvm_args.iter().cloned());
        argv.push("-jar".into());
        argv.push(instance.jar_path.to_string_lossy().into_owned());
        argv.push("nogui".into());
        argv
    }

    fn stop_command(&self) -> String {
        self.stop.clone()
    }

    fn reload_command(&self) -> Option<String> {
        self.reload.clone()
    }

    fn reload_capability(&self) -> ReloadCapability {
        self.capability
    }

    fn watch_patterns(&self) -> Vec<String> {
        self.patterns.clone()
    }

    async fn deploy(&self, artifact: &Path, instance: &ServerInstance) -> anyhow::Result<PathBuf> {
        let file_name = artifact
            .file_name()
            .with_context(|| format!("artifact path {} has no file name", artifact.display()))?;
        let dir = instance.working_dir.join(&self.deploy_dir);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let dest = dir.join(file_name);
        tokio::fs::copy(artifact, &dest)
            .await
            .with_context(|| format!("Failed to copy {} to {}", artifact.display(), dest.display()))?;
        tracing::info!(provider = %self.name, dest = %dest.display(), "Deployed artifact");
        Ok(dest)
    }
}

/// Providers by framework name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn FrameworkProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        for p in [
            JarProvider::vanilla(),
            JarProvider::paper(),
            JarProvider::fabric(),
            JarProvider::forge(),
            JarProvider::skript(),
        ] {
            reg.register(Arc::new(p));
        }
        reg
    }

    pub fn register(&mut self, provider: Arc<dyn FrameworkProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, framework: &str) -> Option<Arc<dyn FrameworkProvider>> {
        self.providers.get(framework).cloned()
    }
}
