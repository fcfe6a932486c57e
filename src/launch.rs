//! Child-process launching for each provider mode.
//!
//! Subprocess mode runs the configured command directly. Docker mode runs a
//! prebuilt image. Container mode auto-detects a runtime (docker, then
//! podman) and supports building the image from a dockerfile first; podman
//! mode pins the runtime. Remote providers are configuration-only and are
//! never launched here.
//!
//! All container invocations attach stdio (`run -i`) so the JSON-RPC channel
//! rides the same pipes as a plain subprocess.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::config::{resolve_env_vars, BuildSpec, ProviderMode, ProviderSpec};
use crate::error::HangarError;
use crate::rpc::RpcClient;

/// Spawn the child for `spec` and wrap it in an [`RpcClient`].
///
/// Container modes may build the image first when `build.dockerfile` is set.
pub async fn spawn_provider(provider_id: &str, spec: &ProviderSpec) -> crate::Result<RpcClient> {
    match spec.mode {
        ProviderMode::Subprocess => spawn_subprocess(provider_id, spec),
        ProviderMode::Docker => {
            let image = require_image(provider_id, spec.image.as_deref())?;
            spawn_container(provider_id, spec, "docker", &image)
        }
        ProviderMode::Container | ProviderMode::Podman => {
            let runtime = if spec.mode == ProviderMode::Podman {
                "podman".to_string()
            } else {
                detect_runtime(provider_id)?
            };

            let image = match &spec.build {
                Some(build) => build_image_if_needed(provider_id, &runtime, build).await?,
                None => require_image(provider_id, spec.image.as_deref())?,
            };
            spawn_container(provider_id, spec, &runtime, &image)
        }
        ProviderMode::Remote => Err(HangarError::ProviderStart(
            provider_id.to_string(),
            "remote providers are not launchable".to_string(),
        )),
    }
}

fn require_image(provider_id: &str, image: Option<&str>) -> crate::Result<String> {
    image.map(str::to_string).ok_or_else(|| {
        HangarError::ProviderStart(
            provider_id.to_string(),
            "container mode requires 'image' or 'build.dockerfile'".to_string(),
        )
    })
}

fn spawn_subprocess(provider_id: &str, spec: &ProviderSpec) -> crate::Result<RpcClient> {
    let program = spec.command.first().ok_or_else(|| {
        HangarError::ProviderStart(
            provider_id.to_string(),
            "subprocess mode requires a non-empty command".to_string(),
        )
    })?;

    let mut cmd = Command::new(program);
    if spec.command.len() > 1 {
        cmd.args(&spec.command[1..]);
    }
    if !spec.env.is_empty() {
        cmd.envs(resolve_env_vars(&spec.env));
    }
    spawn_piped(provider_id, cmd)
}

fn spawn_container(
    provider_id: &str,
    spec: &ProviderSpec,
    runtime: &str,
    image: &str,
) -> crate::Result<RpcClient> {
    let mut cmd = Command::new(runtime);
    cmd.arg("run").arg("-i").arg("--rm");
    cmd.arg("--network").arg(&spec.network);
    if spec.read_only {
        cmd.arg("--read-only");
    }
    if let Some(user) = &spec.user {
        cmd.arg("--user").arg(user);
    }
    for volume in &spec.volumes {
        cmd.arg("-v").arg(volume);
    }
    cmd.arg("--memory").arg(&spec.resources.memory);
    cmd.arg("--cpus").arg(&spec.resources.cpu);
    for (key, value) in resolve_env_vars(&spec.env) {
        cmd.arg("-e").arg(format!("{key}={value}"));
    }
    cmd.arg(image);

    tracing::debug!(
        provider = %provider_id,
        runtime = %runtime,
        image = %image,
        "launching container provider"
    );
    spawn_piped(provider_id, cmd)
}

fn spawn_piped(provider_id: &str, mut cmd: Command) -> crate::Result<RpcClient> {
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| HangarError::Transport(provider_id.to_string(), e.to_string()))?;
    RpcClient::from_child(provider_id, child)
}

/// Pick a container runtime: docker when present on PATH, podman otherwise.
fn detect_runtime(provider_id: &str) -> crate::Result<String> {
    for runtime in ["docker", "podman"] {
        if on_path(runtime) {
            return Ok(runtime.to_string());
        }
    }
    Err(HangarError::ProviderStart(
        provider_id.to_string(),
        "no container runtime found (tried docker, podman)".to_string(),
    ))
}

fn on_path(binary: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(binary).is_file())
}

/// Build the image when its tag is not already present in the runtime.
///
/// Returns the tag to run. The runtime's own image store is the memo — a
/// second start of the same provider hits `image inspect` and skips the
/// build.
async fn build_image_if_needed(
    provider_id: &str,
    runtime: &str,
    build: &BuildSpec,
) -> crate::Result<String> {
    let tag = build
        .tag
        .clone()
        .unwrap_or_else(|| format!("hangar-{provider_id}:latest"));

    let inspect = Command::new(runtime)
        .args(["image", "inspect", &tag])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| HangarError::Transport(provider_id.to_string(), e.to_string()))?;
    if inspect.success() {
        return Ok(tag);
    }

    if !Path::new(&build.dockerfile).exists() {
        return Err(HangarError::ProviderStart(
            provider_id.to_string(),
            format!("dockerfile '{}' not found", build.dockerfile),
        ));
    }

    tracing::info!(provider = %provider_id, tag = %tag, "building provider image");
    let output = Command::new(runtime)
        .args(["build", "-f", &build.dockerfile, "-t", &tag, &build.context])
        .output()
        .await
        .map_err(|e| HangarError::Transport(provider_id.to_string(), e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HangarError::ProviderStart(
            provider_id.to_string(),
            format!("image build failed: {}", stderr.trim()),
        ));
    }

    Ok(tag)
}
