//! Shared fixtures for unit tests: shell-backed mock providers.
//!
//! The mock servers exploit the client's sequential request ids — each
//! response carries the next id in order, which matches because handshake
//! calls are issued sequentially and results here are canned anyway.

use crate::config::{ProviderMode, ProviderSpec};

fn sh_spec(script: &str) -> ProviderSpec {
    ProviderSpec {
        mode: ProviderMode::Subprocess,
        command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        ..ProviderSpec::default()
    }
}

/// A provider whose every request succeeds; advertises one tool, `echo`.
pub fn echo_provider_spec() -> ProviderSpec {
    sh_spec(
        r#"i=1; while read -r line; do printf '{"jsonrpc":"2.0","id":%d,"result":{"tools":[{"name":"echo","description":"echo back","inputSchema":{"type":"object"}}],"ok":true}}\n' "$i"; i=$((i+1)); done"#,
    )
}

/// A provider that completes the handshake, then returns a JSON-RPC error
/// payload for every tool call. Advertises one tool, `boom`.
pub fn failing_tool_spec() -> ProviderSpec {
    sh_spec(
        r#"i=1; while read -r line; do if [ "$i" -le 2 ]; then printf '{"jsonrpc":"2.0","id":%d,"result":{"tools":[{"name":"boom","inputSchema":{"type":"object"}}]}}\n' "$i"; else printf '{"jsonrpc":"2.0","id":%d,"error":{"code":-32000,"message":"tool exploded"}}\n' "$i"; fi; i=$((i+1)); done"#,
    )
}

/// A provider that answers the handshake, then sleeps before every tool
/// response. Advertises one tool, `slow`.
pub fn slow_tool_spec(sleep_s: u32) -> ProviderSpec {
    sh_spec(&format!(
        r#"i=1; while read -r line; do if [ "$i" -le 2 ]; then printf '{{"jsonrpc":"2.0","id":%d,"result":{{"tools":[{{"name":"slow","inputSchema":{{"type":"object"}}}}]}}}}\n' "$i"; else sleep {sleep_s}; printf '{{"jsonrpc":"2.0","id":%d,"result":{{"done":true}}}}\n' "$i"; fi; i=$((i+1)); done"#,
    ))
}

/// A provider whose command cannot be spawned at all.
pub fn no_spawn_spec() -> ProviderSpec {
    ProviderSpec {
        mode: ProviderMode::Subprocess,
        command: vec!["/this/command/does/not/exist-hangar".to_string()],
        ..ProviderSpec::default()
    }
}
