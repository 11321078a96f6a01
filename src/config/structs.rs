use serde::{Deserialize, Serialize};

pub mod prelude {
    pub use super::{Config, Logs, McpServer, Telemetry};
}

/// Defaults for log directory, rotation size, and retained file count.
///
/// Grounded on the teacher's `Runner { shell, args, node, log_path }` config
/// section, narrowed to the subset the core cares about (rotation, not shell
/// invocation, since the supervisor spawns argv directly per SPEC_FULL §4.3).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Logs {
    pub directory: String,
    pub max_size: String,
    pub max_files: u32,
}

impl Default for Logs {
    fn default() -> Self {
        Logs {
            directory: String::new(),
            max_size: "10M".to_string(),
            max_files: 5,
        }
    }
}

/// Bind parameters for the out-of-scope embedded HTTP MCP surface.
///
/// The core never reads this beyond passing it through; it exists so the
/// config file format matches SPEC_FULL §6 and an external collaborator can
/// consume the same `config.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpServer {
    #[serde(default = "default_mcp_address")]
    pub address: String,
    #[serde(default = "default_mcp_port")]
    pub port: u16,
}

fn default_mcp_address() -> String {
    "127.0.0.1".to_string()
}

fn default_mcp_port() -> u16 {
    9877
}

/// Bind target for the out-of-scope Telegraf UDP emitter.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Telemetry {
    pub address: String,
    pub port: u16,
}

/// Top-level, three-state config: a missing section takes the struct
/// `Default`, `None` means explicitly disabled, `Some(_)` means configured.
///
/// A plain `#[serde(default)]` on `Option<T>` cannot tell "absent" apart from
/// an explicit JSON `null` — both collapse to `None`, since Serde's
/// `Option<T>` deserializer treats `null` as `None` regardless of the field's
/// default. Per-field default *functions* sidestep this: they only run when
/// the key is missing entirely, so an absent section gets `Some(default)`
/// while an explicit `null` still reaches the `Option` deserializer and comes
/// out `None`, matching SPEC_FULL §6's three-state semantics exactly.
///
/// Grounded on the teacher's `config::read()` create-on-first-run TOML file,
/// generalized from opm's single `[daemon]`/`[runner]` shape to the spec's
/// three named sections (`logs`, `mcpserver`, `telemetry`), each independently
/// absent/null/configured per SPEC_FULL §6.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_some_logs")]
    pub logs: Option<Logs>,
    #[serde(default = "default_some_mcpserver")]
    pub mcpserver: Option<McpServer>,
    #[serde(default = "default_some_telemetry")]
    pub telemetry: Option<Telemetry>,
}

fn default_some_logs() -> Option<Logs> {
    Some(Logs::default())
}

fn default_some_mcpserver() -> Option<McpServer> {
    Some(McpServer {
        address: default_mcp_address(),
        port: default_mcp_port(),
    })
}

fn default_some_telemetry() -> Option<Telemetry> {
    Some(Telemetry {
        address: default_mcp_address(),
        port: 8125,
    })
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logs: default_some_logs(),
            mcpserver: default_some_mcpserver(),
            telemetry: default_some_telemetry(),
        }
    }
}
