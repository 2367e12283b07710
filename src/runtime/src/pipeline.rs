//! Build engine.
//!
//! Runs a [`BuildDirective`] step by step: each step takes the rootfs of the
//! previous layer, mutates a copy and appends the result to the layer chain.
//! The first failing step halts the build in its current state; nothing is
//! produced and the build cannot be resumed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use a3s_bake_core::config::DEFAULT_FETCH_TIMEOUT_SECS;
use a3s_bake_core::directive::{
    BuildDirective, ListenConfig, Stage, Step, DEFAULT_LISTEN_KEYWORD,
};
use a3s_bake_core::error::{BakeError, Result};
use a3s_bake_core::event::{BuildEvent, BuildEventKind, EventEmitter};
use a3s_bake_core::{BakeConfig, BuildState, RuntimeConfig};

use crate::artifact::{check_artifacts, place_artifact, set_working_directory, BuildContext};
use crate::entrypoint::{check_listen_consistency, declared_ports, runtime_config};
use crate::layer::{ImageLayer, LayerChain};
use crate::packages::{PackageInstaller, PackageRepository};
use crate::patch::{apply_patch, write_file};
use crate::reference::ImageReference;
use crate::resolve::{resolve_base, BaseResolver};
use crate::rootfs::{resolve_path, Rootfs};

/// Configuration for a build operation.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Deadline for each network-bound step
    pub fetch_timeout: Duration,
    /// Image tag (e.g., "php-app:latest")
    pub tag: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            tag: None,
        }
    }
}

impl From<&BakeConfig> for BuildConfig {
    fn from(config: &BakeConfig) -> Self {
        Self {
            fetch_timeout: config.fetch_timeout(),
            tag: None,
        }
    }
}

/// Result of a successful build: the layer chain and its runtime contract.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub build_id: String,
    pub tag: Option<String>,
    /// Fully qualified base image reference
    pub base: String,
    pub layers: LayerChain,
    pub runtime_config: RuntimeConfig,
    pub created: chrono::DateTime<chrono::Utc>,
}

impl BuiltImage {
    /// Final filesystem of the image.
    pub fn rootfs(&self) -> Arc<Rootfs> {
        self.layers.rootfs()
    }

    pub fn chain_id(&self) -> &str {
        self.layers.chain_id()
    }

    pub fn top(&self) -> Option<&ImageLayer> {
        self.layers.top()
    }

    /// Total compressed size of all layer blobs.
    pub fn size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Mutable state accumulated during the build.
struct Progress {
    state: BuildState,
    chain: LayerChain,
    base: String,
    workdir: String,
    env: BTreeMap<String, String>,
    port: Option<u16>,
    command: Vec<String>,
    args: Vec<String>,
    artifacts_checked: bool,
    /// Files rewritten by PATCH and WRITE steps, in step order
    configured: Vec<String>,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: BuildState::Unbuilt,
            chain: LayerChain::new(),
            base: String::new(),
            workdir: "/".to_string(),
            env: BTreeMap::new(),
            port: None,
            command: Vec::new(),
            args: Vec::new(),
            artifacts_checked: false,
            configured: Vec::new(),
        }
    }
}

/// Provisioning pipeline over a base resolver, a package repository and a
/// build context.
#[derive(Clone)]
pub struct Pipeline {
    bases: Arc<dyn BaseResolver>,
    packages: Arc<dyn PackageRepository>,
    context: Arc<dyn BuildContext>,
    config: BuildConfig,
    events: EventEmitter,
}

impl Pipeline {
    pub fn new(
        bases: Arc<dyn BaseResolver>,
        packages: Arc<dyn PackageRepository>,
        context: Arc<dyn BuildContext>,
    ) -> Self {
        Self {
            bases,
            packages,
            context,
            config: BuildConfig::default(),
            events: EventEmitter::default(),
        }
    }

    pub fn with_config(mut self, config: BuildConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish build events on `events` instead of a private emitter.
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Execute a full build of `directive`.
    ///
    /// # Process
    ///
    /// 1. Validate the directive (nothing is fetched for invalid ones)
    /// 2. Run each step against a copy of the previous layer's rootfs
    /// 3. Check the exposed port against the configured listening port
    /// 4. Derive the runtime config; the chain becomes `Ready`
    pub async fn build(&self, directive: &BuildDirective) -> Result<BuiltImage> {
        let build_id = uuid::Uuid::new_v4().to_string();
        let emit = |kind: BuildEventKind| self.events.emit(BuildEvent::new(build_id.clone(), kind));

        if let Err(e) = directive.validate() {
            tracing::warn!(build_id = %build_id, error = %e, "Directive rejected");
            emit(BuildEventKind::Failed {
                index: None,
                state: BuildState::Unbuilt,
                message: e.to_string(),
            });
            return Err(e);
        }

        let total = directive.len();
        tracing::info!(build_id = %build_id, steps = total, tag = ?self.config.tag, "Build started");
        emit(BuildEventKind::Started { steps: total });

        let mut progress = Progress::new();
        for (idx, step) in directive.steps.iter().enumerate() {
            let position = idx + 1;
            let description = step.to_string();
            tracing::info!(build_id = %build_id, "Step {}/{}: {}", position, total, description);
            emit(BuildEventKind::StepStarted {
                index: position,
                step: description.clone(),
            });

            let outcome = match self.run_step(directive, step, &mut progress).await {
                Ok(rootfs) => progress.chain.push(description.clone(), rootfs).map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                let (position, description) = blame(directive, &e, position, description);
                return Err(self.fail(&build_id, e, position, description, progress.state));
            }

            if let Some(reached) = step.stage().and_then(Stage::reached_state) {
                progress.state = progress.state.advance(reached);
            }

            let (digest, empty_layer) = progress
                .chain
                .top()
                .map(|l| (l.digest.clone(), l.is_empty()))
                .unwrap_or_default();
            emit(BuildEventKind::StepCompleted {
                index: position,
                state: progress.state,
                digest,
                empty_layer,
            });
        }

        let port = progress
            .port
            .ok_or_else(|| BakeError::InvalidDirective("no exposed port".to_string()))?;
        let port_position = directive
            .steps
            .iter()
            .position(|s| matches!(s, Step::ExposePort { .. }))
            .map_or(total, |idx| idx + 1);

        let rootfs = progress.chain.rootfs();
        let listen = directive
            .listen
            .clone()
            .or_else(|| infer_listen(&rootfs, &progress.configured));
        let checked = match &listen {
            Some(listen) => check_listen_consistency(&rootfs, listen, &progress.workdir, port),
            None => Err(BakeError::Consistency {
                exposed: port,
                declared: Vec::new(),
            }),
        };
        if let Err(e) = checked {
            return Err(self.fail(
                &build_id,
                e,
                port_position,
                directive.steps[port_position - 1].to_string(),
                progress.state,
            ));
        }

        let runtime_config = runtime_config(
            port,
            &progress.workdir,
            &progress.command,
            &progress.args,
            progress.env.clone(),
        )?;
        progress.state = progress.state.advance(BuildState::Ready);

        let image = BuiltImage {
            build_id: build_id.clone(),
            tag: self.config.tag.clone(),
            base: progress.base,
            layers: progress.chain,
            runtime_config,
            created: chrono::Utc::now(),
        };

        tracing::info!(
            build_id = %build_id,
            state = %progress.state,
            chain_id = %image.chain_id(),
            layers = image.layers.len(),
            size = image.size(),
            "Build completed"
        );
        emit(BuildEventKind::Completed {
            chain_id: image.chain_id().to_string(),
        });

        Ok(image)
    }

    /// Apply one step to a copy of the current rootfs.
    async fn run_step(
        &self,
        directive: &BuildDirective,
        step: &Step,
        progress: &mut Progress,
    ) -> Result<Rootfs> {
        if step.stage() == Some(Stage::Artifacts) && !progress.artifacts_checked {
            // All-or-nothing: every artifact must exist before the first copy.
            check_artifacts(self.context.as_ref(), directive.artifact_sources())?;
            progress.artifacts_checked = true;
        }

        let mut rootfs = (*progress.chain.rootfs()).clone();
        let workdir = progress.workdir.clone();

        match step {
            Step::FetchBase { reference } => {
                rootfs =
                    resolve_base(self.bases.as_ref(), reference, self.config.fetch_timeout).await?;
                progress.base = ImageReference::parse(reference)?.full_reference();
                tracing::info!(reference = %progress.base, entries = rootfs.len(), "Base image resolved");
            }
            Step::InstallPackages {
                packages,
                interactive,
            } => {
                let installer =
                    PackageInstaller::new(self.packages.as_ref(), self.config.fetch_timeout);
                let report = installer.install(&mut rootfs, packages, *interactive).await?;
                tracing::info!(
                    installed = report.installed.len(),
                    skipped = report.skipped.len(),
                    "Packages installed"
                );
            }
            Step::PatchFile {
                path,
                pattern,
                replacement,
                scope,
            } => {
                let target = resolve_path(&workdir, path);
                apply_patch(&mut rootfs, &target, pattern, replacement, scope)?;
                progress.configured.push(target);
            }
            Step::WriteFile { path, content } => {
                let target = resolve_path(&workdir, path);
                write_file(&mut rootfs, &target, content)?;
                progress.configured.push(target);
            }
            Step::CopyArtifact { source, dest } => {
                place_artifact(&mut rootfs, self.context.as_ref(), source, dest, &workdir)?;
            }
            Step::SetWorkingDirectory { path } => {
                progress.workdir = set_working_directory(&mut rootfs, &workdir, path)?;
            }
            Step::SetEnv { key, value } => {
                progress.env.insert(key.clone(), value.clone());
            }
            Step::ExposePort { port } => {
                progress.port = Some(*port);
            }
            Step::SetEntrypoint { command, args } => {
                progress.command = command.clone();
                progress.args = args.clone();
            }
        }

        Ok(rootfs)
    }

    fn fail(
        &self,
        build_id: &str,
        error: BakeError,
        position: usize,
        step: String,
        state: BuildState,
    ) -> BakeError {
        let error = error.at_step(position, step, state);
        tracing::error!(build_id = %build_id, state = %state, error = %error, "Build failed");
        self.events.emit(BuildEvent::new(
            build_id,
            BuildEventKind::Failed {
                index: Some(position),
                state,
                message: error.to_string(),
            },
        ));
        error
    }
}

/// Without an explicit listen config, the first patched or written file
/// that declares `Listen` ports is the one the exposed port must match.
fn infer_listen(rootfs: &Rootfs, configured: &[String]) -> Option<ListenConfig> {
    let path = configured.iter().find(|path| {
        rootfs.read_file(path.as_str()).map_or(false, |data| {
            !declared_ports(&String::from_utf8_lossy(data), DEFAULT_LISTEN_KEYWORD).is_empty()
        })
    })?;
    tracing::debug!(path = %path, "Listening port inferred from configured file");
    Some(ListenConfig::new(path.as_str()))
}

/// Attribute a missing artifact to the step that copies it.
fn blame(
    directive: &BuildDirective,
    error: &BakeError,
    position: usize,
    description: String,
) -> (usize, String) {
    if let BakeError::ArtifactMissing { source_name } = error {
        let copying = directive.steps.iter().enumerate().find(|(_, s)| {
            matches!(s, Step::CopyArtifact { source, .. } if source == source_name)
        });
        if let Some((idx, step)) = copying {
            return (idx + 1, step.to_string());
        }
    }
    (position, description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryContext;
    use crate::packages::{MemoryRepository, Package, STATUS_PATH};
    use crate::resolve::MemoryBaseStore;
    use crate::rootfs::DEFAULT_FILE_MODE;
    use a3s_bake_core::ErrorKind;
    use async_trait::async_trait;

    fn base_store() -> MemoryBaseStore {
        let mut base = Rootfs::new();
        base.write_file("/etc/os-release", "ID=base-os\nVERSION_ID=20.04\n", DEFAULT_FILE_MODE)
            .unwrap();
        base.mkdir_p("/tmp").unwrap();
        MemoryBaseStore::new().with_image("base-os:20.04", base).unwrap()
    }

    fn repository() -> MemoryRepository {
        MemoryRepository::new()
            .with_package(
                Package::new("httpd", "2.4.41")
                    .file("/ports.conf", "# Apache ports\nListen 80\n")
                    .unwrap()
                    .file(
                        "/vhost.conf",
                        "<VirtualHost *:80>\n    DocumentRoot /var/www/html\n</VirtualHost>\n",
                    )
                    .unwrap()
                    .file("/usr/sbin/httpd-ctl", "#!/bin/sh\n")
                    .unwrap(),
            )
            .with_package(
                Package::new("phpRuntime", "7.4.3")
                    .depends_on("httpd")
                    .file("/usr/bin/php", "ELF")
                    .unwrap(),
            )
            .with_package(
                Package::new("devTools", "1.0")
                    .prompt("Install documentation?", "no")
                    .file("/usr/bin/make", "ELF")
                    .unwrap(),
            )
    }

    fn context() -> MemoryContext {
        MemoryContext::new()
            .with_file("index.php", "<?php echo 'index';")
            .with_file("register.php", "<?php echo 'register';")
    }

    fn scenario() -> BuildDirective {
        BuildDirective::new(vec![
            Step::fetch_base("base-os:20.04"),
            Step::install(["httpd", "phpRuntime", "devTools"], false),
            Step::patch("ports.conf", "80", "8080"),
            Step::patch("vhost.conf", ":80>", ":8080>"),
            Step::copy("index.php", "/srv/www/index.php"),
            Step::copy("register.php", "/srv/www/register.php"),
            Step::workdir("/srv/www"),
            Step::expose(8080),
            Step::entrypoint(["httpd-ctl", "-D", "FOREGROUND"]),
        ])
        .with_listen(ListenConfig::new("/ports.conf"))
    }

    fn pipeline(context: MemoryContext) -> Pipeline {
        Pipeline::new(
            Arc::new(base_store()),
            Arc::new(repository()),
            Arc::new(context),
        )
    }

    #[tokio::test]
    async fn test_scenario_build() {
        let image = pipeline(context()).build(&scenario()).await.unwrap();

        assert_eq!(image.layers.len(), 9);
        assert_eq!(image.base, "docker.io/library/base-os:20.04");
        assert_eq!(
            image.runtime_config,
            RuntimeConfig {
                listening_port: 8080,
                working_directory: "/srv/www".to_string(),
                entrypoint_command: "httpd-ctl".to_string(),
                entrypoint_args: vec!["-D".to_string(), "FOREGROUND".to_string()],
                env: BTreeMap::new(),
            }
        );

        let rootfs = image.rootfs();
        assert_eq!(rootfs.read_file("/ports.conf").unwrap(), b"# Apache ports\nListen 8080\n");
        assert_eq!(
            rootfs.read_file("/vhost.conf").unwrap(),
            b"<VirtualHost *:8080>\n    DocumentRoot /var/www/html\n</VirtualHost>\n"
        );
        assert_eq!(rootfs.read_file("/srv/www/register.php").unwrap(), b"<?php echo 'register';");
        assert!(rootfs.exists(STATUS_PATH));

        // metadata-only steps add empty layers
        assert!(image.layers.get(7).unwrap().is_empty());
        assert!(image.layers.get(8).unwrap().is_empty());
        assert!(!image.layers.get(4).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_builds_are_deterministic() {
        let first = pipeline(context()).build(&scenario()).await.unwrap();
        let second = pipeline(context()).build(&scenario()).await.unwrap();

        assert_eq!(first.runtime_config, second.runtime_config);
        assert_eq!(first.chain_id(), second.chain_id());
        assert_ne!(first.build_id, second.build_id);
        let digests = |image: &BuiltImage| -> Vec<String> {
            image.layers.iter().map(|l| l.digest.clone()).collect()
        };
        assert_eq!(digests(&first), digests(&second));
    }

    #[tokio::test]
    async fn test_missing_artifact_halts_in_patched() {
        let mut ctx = context();
        ctx.remove("register.php");
        let pipeline = pipeline(ctx);
        let mut events = pipeline.events().subscribe();

        let err = pipeline.build(&scenario()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArtifactMissing);
        assert_eq!(err.halted_state(), Some(BuildState::Patched));
        match err.root() {
            BakeError::ArtifactMissing { source_name } => assert_eq!(source_name, "register.php"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().starts_with("step 6 (COPY register.php"));

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        let last = last.unwrap();
        assert!(last.is_terminal());
        assert!(matches!(
            last.kind,
            BuildEventKind::Failed {
                index: Some(6),
                state: BuildState::Patched,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_patch_pattern_absent() {
        let mut directive = scenario();
        directive.steps[2] = Step::patch("ports.conf", "443", "8443");

        let err = pipeline(context()).build(&directive).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Patch);
        assert_eq!(err.halted_state(), Some(BuildState::PackagesInstalled));
    }

    #[tokio::test]
    async fn test_port_inconsistency() {
        let mut directive = scenario();
        directive.steps[7] = Step::expose(9090);

        let err = pipeline(context()).build(&directive).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert_eq!(err.halted_state(), Some(BuildState::ArtifactsPlaced));
        assert!(err.to_string().starts_with("step 8 (EXPOSE 9090)"));
    }

    #[tokio::test]
    async fn test_listen_inferred_from_patched_file() {
        let mut directive = scenario();
        directive.listen = None;

        let image = pipeline(context()).build(&directive).await.unwrap();
        assert_eq!(image.runtime_config.listening_port, 8080);
    }

    #[tokio::test]
    async fn test_port_inconsistency_without_listen_config() {
        let mut directive = scenario();
        directive.listen = None;
        directive.steps[7] = Step::expose(9090);

        let err = pipeline(context()).build(&directive).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert_eq!(err.halted_state(), Some(BuildState::ArtifactsPlaced));
        assert!(err.to_string().starts_with("step 8 (EXPOSE 9090)"));
    }

    #[tokio::test]
    async fn test_no_listen_declaration_fails() {
        let directive = BuildDirective::new(vec![
            Step::fetch_base("base-os:20.04"),
            Step::copy("index.php", "/srv/www/index.php"),
            Step::expose(8080),
            Step::entrypoint(["httpd-ctl"]),
        ]);

        let err = pipeline(context()).build(&directive).await.unwrap_err();
        match err.root() {
            BakeError::Consistency { exposed, declared } => {
                assert_eq!(*exposed, 8080);
                assert!(declared.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_base() {
        let mut directive = scenario();
        directive.steps[0] = Step::fetch_base("base-os:99.04");

        let err = pipeline(context()).build(&directive).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert_eq!(err.halted_state(), Some(BuildState::Unbuilt));
    }

    #[tokio::test]
    async fn test_missing_package() {
        let mut directive = scenario();
        directive.steps[1] = Step::install(["httpd", "mod-perl"], false);

        let err = pipeline(context()).build(&directive).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Install);
        assert_eq!(err.halted_state(), Some(BuildState::Based));
    }

    #[tokio::test]
    async fn test_invalid_directive_fetches_nothing() {
        let directive = BuildDirective::new(vec![Step::expose(8080), Step::fetch_base("base-os:20.04")]);
        let err = pipeline(context()).build(&directive).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDirective);
        assert_eq!(err.halted_state(), None);
    }

    #[tokio::test]
    async fn test_reinstall_produces_empty_layer() {
        let mut directive = scenario();
        directive
            .steps
            .insert(2, Step::install(["httpd", "phpRuntime", "devTools"], false));

        let image = pipeline(context()).build(&directive).await.unwrap();
        assert!(image.layers.get(2).unwrap().is_empty());
        assert_eq!(image.layers.len(), 10);
    }

    #[tokio::test]
    async fn test_env_and_entrypoint_args() {
        let mut directive = scenario();
        directive.steps.insert(1, Step::SetEnv {
            key: "DEBIAN_FRONTEND".to_string(),
            value: "noninteractive".to_string(),
        });
        let last = directive.steps.len() - 1;
        directive.steps[last] = Step::SetEntrypoint {
            command: vec!["httpd-ctl".to_string()],
            args: vec!["-D".to_string(), "FOREGROUND".to_string()],
        };

        let image = pipeline(context()).build(&directive).await.unwrap();
        assert_eq!(image.runtime_config.entrypoint_args, vec!["-D", "FOREGROUND"]);
        assert_eq!(
            image.runtime_config.env.get("DEBIAN_FRONTEND").map(String::as_str),
            Some("noninteractive")
        );
    }

    struct SlowRepository;

    #[async_trait]
    impl PackageRepository for SlowRepository {
        async fn fetch(&self, name: &str) -> Result<Package> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Package::new(name, "1.0"))
        }
    }

    #[tokio::test]
    async fn test_slow_repository_times_out() {
        let pipeline = Pipeline::new(
            Arc::new(base_store()),
            Arc::new(SlowRepository),
            Arc::new(context()),
        )
        .with_config(BuildConfig {
            fetch_timeout: Duration::from_millis(50),
            tag: None,
        });

        let err = pipeline.build(&scenario()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.halted_state(), Some(BuildState::Based));
    }

    #[tokio::test]
    async fn test_events_follow_steps() {
        let pipeline = pipeline(context());
        let mut events = pipeline.events().subscribe();
        pipeline.build(&scenario()).await.unwrap();

        let mut keys = Vec::new();
        while let Ok(event) = events.try_recv() {
            keys.push(event.key());
        }
        assert_eq!(keys.first(), Some(&"build.started"));
        assert_eq!(keys.last(), Some(&"build.completed"));
        assert_eq!(keys.iter().filter(|k| **k == "build.step.completed").count(), 9);
    }
}
