//! Chain spec and genesis artifact generation.
//!
//! Anything that needs a chain binary runs inside a short-lived helper node
//! on the active provider. On container backends the helper writes its
//! output under the config dir, then idles until the magic file appears so
//! its files can be copied out first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::RemotePaths;
use crate::config::CompilationContext;
use crate::constants::{
    wait_until_script_suffix, CLIENT_REMOTE_DIR_PLACEHOLDER, CONTAINER_READY_POLL, GENESIS_STATE_FILENAME,
    GENESIS_WASM_FILENAME, NODE_CONTAINER_WAIT_LOG,
};
use crate::error::{OrchestratorError, Result};
use crate::genesis::{customize_parachain_spec, fix_para_id, ChainSpec};
use crate::provider::{wait_until, FileTransfer, Provider, ProviderKind};
use crate::topology::{ChainSpecSource, ContainerImage, GenesisArtifact, Node, NodeRole, Parachain, RelayChain};

/// Local files a parachain needs before its collators start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParachainFiles {
    /// Raw chain spec of a cumulus based parachain.
    pub spec: Option<ChainSpec>,
    /// Genesis head.
    pub genesis_state: PathBuf,
    /// Validation code.
    pub genesis_wasm: PathBuf,
}

impl ParachainFiles {
    /// Reads the genesis head and validation code.
    pub async fn read_genesis(&self) -> Result<(String, String)> {
        let head = tokio::fs::read_to_string(&self.genesis_state).await?;
        let wasm = tokio::fs::read_to_string(&self.genesis_wasm).await?;
        Ok((head.trim().to_string(), wasm.trim().to_string()))
    }
}

/// Produces chain specs and genesis artifacts through helper nodes.
pub struct ChainSpecBuilder<'a> {
    provider: &'a dyn Provider,
    timeout: Duration,
}

impl<'a> ChainSpecBuilder<'a> {
    /// Creates a builder; `timeout` bounds the wait for each helper.
    pub fn new(provider: &'a dyn Provider, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    /// Local path of the relay chain's plain spec.
    pub fn relay_plain_path(&self, chain: &str) -> PathBuf {
        self.provider.tmp_dir().join(format!("{chain}-plain.json"))
    }

    /// Local path of the relay chain's raw spec.
    pub fn relay_raw_path(&self, chain: &str) -> PathBuf {
        self.provider.tmp_dir().join(format!("{chain}-raw.json"))
    }

    /// Places the relay chain's spec at `<tmp>/<chain>-plain.json`.
    ///
    /// A configured file is copied; otherwise the configured command runs
    /// in a helper node and its output is collected.
    pub async fn relay_plain(&self, relay: &RelayChain, ctx: &mut CompilationContext) -> Result<ChainSpec> {
        let target = self.relay_plain_path(&relay.chain);
        match &relay.chain_spec {
            ChainSpecSource::Path(path) => {
                tokio::fs::copy(path, &target).await?;
                debug!(from = %path.display(), "Copied relay chain spec");
            }
            ChainSpecSource::Command(command) => {
                let file = format!("{}-plain.json", relay.chain);
                let helper = self
                    .spawn_helper(ctx, &relay.image, &[], |paths| format!("{command} > {}/{file}", paths.cfg))
                    .await?;
                helper.fetch_spec(&file, &target).await?;
                helper.release().await?;
            }
        }
        let spec = ChainSpec::new(target);
        spec.read().await?;
        info!(chain = %relay.chain, "Relay chain spec ready");
        Ok(spec)
    }

    /// Converts the customized relay spec to its raw form.
    ///
    /// An already raw spec is copied as is.
    pub async fn relay_raw(&self, relay: &RelayChain, plain: &ChainSpec, ctx: &mut CompilationContext) -> Result<ChainSpec> {
        let target = self.relay_raw_path(&relay.chain);
        if plain.is_raw().await? {
            tokio::fs::copy(plain.path(), &target).await?;
            return Ok(ChainSpec::new(target));
        }

        let plain_file = format!("{}-plain.json", relay.chain);
        let raw_file = format!("{}-raw.json", relay.chain);
        let files = [(plain.path().to_path_buf(), plain_file.clone())];
        let helper = self
            .spawn_helper(ctx, &relay.image, &files, |paths| {
                format!(
                    "{} --raw > {}/{raw_file}",
                    build_spec_command(&relay.command, &format!("{}/{plain_file}", paths.cfg)),
                    paths.cfg
                )
            })
            .await?;
        let spec = helper.fetch_spec(&raw_file, &target).await?;
        helper.release().await?;
        info!(chain = %relay.chain, "Raw relay chain spec ready");
        Ok(spec)
    }

    /// Builds the chain spec and genesis artifacts of `para`.
    ///
    /// `relay_chain` names the relay chain and `relay_chain_id` is the `id`
    /// of its spec. Files land in `<tmp>/<para id>/`.
    pub async fn parachain(
        &self,
        para: &Parachain,
        relay_chain: &str,
        relay_chain_id: &str,
        ctx: &mut CompilationContext,
    ) -> Result<ParachainFiles> {
        let dir = self.provider.tmp_dir().join(para.id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let first = para
            .collators
            .first()
            .ok_or_else(|| OrchestratorError::config_validation(format!("no collator defined for parachain {}", para.id)))?;
        let spec_name = para.spec_name(relay_chain);

        let spec = match &para.chain_spec {
            Some(source) if para.cumulus_based => {
                Some(self.parachain_spec(para, source, first, &spec_name, relay_chain_id, ctx).await?)
            }
            _ => None,
        };

        let genesis_state = dir.join(GENESIS_STATE_FILENAME);
        let genesis_wasm = dir.join(GENESIS_WASM_FILENAME);
        let mut commands = Vec::new();
        for (artifact, target) in [(&para.genesis_state, &genesis_state), (&para.genesis_wasm, &genesis_wasm)] {
            match artifact {
                GenesisArtifact::File(path) => {
                    tokio::fs::copy(path, target).await?;
                }
                GenesisArtifact::Generate(command) => commands.push((command.clone(), target.clone())),
            }
        }

        if !commands.is_empty() {
            let spec_file = format!("{spec_name}.json");
            let files: Vec<(PathBuf, String)> = spec
                .iter()
                .map(|s| (s.path().to_path_buf(), spec_file.clone()))
                .collect();
            let with_spec = spec.is_some();
            let helper = self
                .spawn_helper(ctx, &first.image, &files, |paths| {
                    commands
                        .iter()
                        .map(|(cmd, _)| generator_command(cmd, paths, with_spec.then_some(spec_file.as_str())))
                        .collect::<Vec<_>>()
                        .join(" && ")
                })
                .await?;
            for (_, target) in &commands {
                let file = target.file_name().and_then(|f| f.to_str()).unwrap_or_default();
                helper.fetch(file, target).await?;
            }
            helper.release().await?;
        }

        info!(para_id = para.id, "Parachain genesis artifacts ready");
        Ok(ParachainFiles {
            spec,
            genesis_state,
            genesis_wasm,
        })
    }

    async fn parachain_spec(
        &self,
        para: &Parachain,
        source: &ChainSpecSource,
        collator: &Node,
        spec_name: &str,
        relay_chain_id: &str,
        ctx: &mut CompilationContext,
    ) -> Result<ChainSpec> {
        let tmp = self.provider.tmp_dir();
        let plain_file = format!("{spec_name}-plain.json");
        let raw_file = format!("{spec_name}.json");
        let plain = ChainSpec::new(tmp.join(&plain_file));
        let raw = tmp.join(&raw_file);

        match source {
            ChainSpecSource::Path(path) => {
                tokio::fs::copy(path, plain.path()).await?;
            }
            ChainSpecSource::Command(command) => {
                let helper = self
                    .spawn_helper(ctx, &collator.image, &[], |paths| {
                        format!("{command} > {}/{plain_file}", paths.cfg)
                    })
                    .await?;
                helper.fetch_spec(&plain_file, plain.path()).await?;
                helper.release().await?;
            }
        }

        let spec = if plain.is_raw().await? {
            tokio::fs::copy(plain.path(), &raw).await?;
            ChainSpec::new(raw)
        } else {
            customize_parachain_spec(&plain, para, relay_chain_id, ctx).await?;
            let files = [(plain.path().to_path_buf(), plain_file.clone())];
            let helper = self
                .spawn_helper(ctx, &collator.image, &files, |paths| {
                    format!(
                        "{} --raw > {}/{raw_file}",
                        build_spec_command(&collator.command, &format!("{}/{plain_file}", paths.cfg)),
                        paths.cfg
                    )
                })
                .await?;
            let spec = helper.fetch_spec(&raw_file, &raw).await?;
            helper.release().await?;
            spec
        };

        fix_para_id(&spec, para.id).await?;
        Ok(spec)
    }

    /// Starts a helper running the script returned by `script`.
    ///
    /// `files` are `(local path, file name)` pairs placed in the helper's
    /// config dir.
    async fn spawn_helper<F>(
        &self,
        ctx: &mut CompilationContext,
        image: &ContainerImage,
        files: &[(PathBuf, String)],
        script: F,
    ) -> Result<Helper<'a>>
    where
        F: FnOnce(&RemotePaths) -> String,
    {
        let name = ctx.unique_name("temp");
        let paths = self.provider.remote_paths(&name);
        let native = self.provider.kind() == ProviderKind::Native;

        let mut script = script(&paths);
        if !native {
            script = format!("{script} && {}", wait_until_script_suffix());
        }
        debug!(node = %name, script = %script, "Spawning helper");

        let node = Node::builder(&name, NodeRole::Temp)
            .image(image.clone())
            .full_command(script)
            .build();
        let def = self.provider.generate_resource_definition(&node)?;
        let transfers: Vec<FileTransfer> = files
            .iter()
            .map(|(local, file)| FileTransfer::new(local, format!("{}/{file}", paths.cfg)))
            .collect();
        self.provider.spawn(&def, &transfers).await?;

        if !native {
            let provider = self.provider;
            let node_name = name.as_str();
            let finished = wait_until(self.timeout, CONTAINER_READY_POLL, || async move {
                Ok(provider.logs(node_name, None).await?.contains(NODE_CONTAINER_WAIT_LOG))
            })
            .await?;
            if !finished {
                return Err(OrchestratorError::spawn_timeout(&name, "helper"));
            }
        }

        Ok(Helper {
            provider: self.provider,
            name,
            paths,
        })
    }
}

/// A helper node whose output is ready to be collected.
struct Helper<'a> {
    provider: &'a dyn Provider,
    name: String,
    paths: RemotePaths,
}

impl Helper<'_> {
    fn remote(&self, file: &str) -> String {
        format!("{}/{file}", self.paths.cfg)
    }

    async fn fetch(&self, file: &str, local: &Path) -> Result<()> {
        self.provider.copy_file_from_node(&self.name, &self.remote(file), local).await
    }

    /// Copies a chain spec out and checks it parses.
    ///
    /// A missing, empty or truncated copy is retried once by printing the
    /// file inside the node.
    async fn fetch_spec(&self, file: &str, local: &Path) -> Result<ChainSpec> {
        let spec = ChainSpec::new(local);
        let copied = self.fetch(file, local).await;
        let first = match copied {
            Ok(()) => spec.read().await.map(|_| ()),
            Err(e) => Err(e),
        };
        let Err(e) = first else {
            return Ok(spec);
        };

        warn!(node = %self.name, file = %file, error = %e, "Copied chain spec is invalid, reading it in place");
        let remote = self.remote(file);
        let out = self.provider.exec(&self.name, &["cat", &remote]).await?;
        if !out.success() || out.stdout.trim().is_empty() {
            return Err(OrchestratorError::chain_spec_invalid(format!(
                "invalid chain spec generated at {remote}"
            )));
        }
        tokio::fs::write(local, out.stdout).await?;
        spec.read().await?;
        Ok(spec)
    }

    async fn release(self) -> Result<()> {
        self.provider.put_magic_file(&self.name).await
    }
}

fn build_spec_command(binary: &str, chain: &str) -> String {
    format!("{binary} build-spec --chain {chain} --disable-default-bootnode")
}

/// Expands a genesis generator for one helper.
///
/// With a parachain spec the generator is pointed at it through `--chain`.
fn generator_command(command: &str, paths: &RemotePaths, spec_file: Option<&str>) -> String {
    let command = command.replace(CLIENT_REMOTE_DIR_PLACEHOLDER, &paths.cfg);
    match spec_file {
        Some(file) if !command.contains("--chain") => {
            command.replacen(" > ", &format!(" --chain {}/{file} > ", paths.cfg), 1)
        }
        _ => command,
    }
}
