//! Runtime configuration.
//!
//! Options are resolved in precedence order: explicit `FamOptions` passed to
//! `Fam::initialize` win over values from a discovered YAML config file,
//! which win over built-in defaults. The config file is looked up from
//! `$FAM_CONFIG_FILE`, falling back to `./fam_config.yaml`.

use crate::descriptor::MemoryType;
use crate::error::{FamError, FamResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadModel {
    Serialize,
    Multiple,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextModel {
    Default,
    Region,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FamModel {
    SharedMemory,
    MemoryServer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CisInterfaceType {
    Direct,
    Rpc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeRuntimeKind {
    None,
    Pmi2,
    Pmix,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcFrameworkType {
    Grpc,
    Thallium,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Switch {
    Enable,
    Disable,
}

impl Switch {
    fn as_bool(self) -> bool {
        matches!(self, Switch::Enable)
    }
}

/// API-level option overrides. Every field left `None` falls back to the
/// config file and then to the default.
#[derive(Clone, Debug, Default)]
pub struct FamOptions {
    pub default_region_name: Option<String>,
    pub cis_server: Option<String>,
    pub grpc_port: Option<u16>,
    pub libfabric_provider: Option<String>,
    pub if_device: Option<String>,
    pub thread_model: Option<ThreadModel>,
    pub context_model: Option<ContextModel>,
    pub openfam_model: Option<FamModel>,
    pub cis_interface_type: Option<CisInterfaceType>,
    pub runtime: Option<PeRuntimeKind>,
    pub num_consumer: Option<u64>,
    pub default_memory_type: Option<MemoryType>,
    pub rpc_framework_type: Option<RpcFrameworkType>,
    pub resource_release: Option<bool>,
    pub local_buf_addr: Option<u64>,
    pub local_buf_size: Option<u64>,
    pub num_memory_servers: Option<u64>,
    pub memory_per_server: Option<u64>,
    pub interleave_size: Option<u64>,
    pub backup_path: Option<PathBuf>,
}

/// On-disk YAML schema; all keys optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    default_region_name: Option<String>,
    cis_server: Option<String>,
    grpc_port: Option<u16>,
    libfabric_provider: Option<String>,
    if_device: Option<String>,
    thread_model: Option<ThreadModel>,
    context_model: Option<ContextModel>,
    openfam_model: Option<FamModel>,
    cis_interface_type: Option<CisInterfaceType>,
    runtime: Option<PeRuntimeKind>,
    num_consumer: Option<u64>,
    default_memory_type: Option<MemoryType>,
    rpc_framework_type: Option<RpcFrameworkType>,
    resource_release: Option<Switch>,
    num_memory_servers: Option<u64>,
    memory_per_server: Option<u64>,
    interleave_size: Option<u64>,
    backup_path: Option<PathBuf>,
}

/// Fully resolved configuration.
#[derive(Clone, Debug)]
pub struct FamConfig {
    pub default_region_name: String,
    pub cis_server: String,
    pub grpc_port: u16,
    pub libfabric_provider: String,
    pub if_device: String,
    pub thread_model: ThreadModel,
    pub context_model: ContextModel,
    pub openfam_model: FamModel,
    pub cis_interface_type: CisInterfaceType,
    pub runtime: PeRuntimeKind,
    pub num_consumer: u64,
    pub default_memory_type: MemoryType,
    /// Recorded for introspection; the wire framing is the same either way.
    pub rpc_framework_type: RpcFrameworkType,
    pub resource_release: bool,
    pub local_buf: Option<(u64, u64)>,
    pub num_memory_servers: u64,
    pub memory_per_server: u64,
    pub interleave_size: u64,
    pub backup_path: PathBuf,
}

impl FamConfig {
    pub fn resolve(options: &FamOptions) -> FamResult<FamConfig> {
        let file = discover_config_file()?;
        Self::resolve_with_file(options, file)
    }

    fn resolve_with_file(options: &FamOptions, file: ConfigFile) -> FamResult<FamConfig> {
        let config = FamConfig {
            default_region_name: options
                .default_region_name
                .clone()
                .or(file.default_region_name)
                .unwrap_or_else(|| "Default".to_string()),
            cis_server: options
                .cis_server
                .clone()
                .or(file.cis_server)
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            grpc_port: options.grpc_port.or(file.grpc_port).unwrap_or(8787),
            libfabric_provider: options
                .libfabric_provider
                .clone()
                .or(file.libfabric_provider)
                .unwrap_or_else(|| "sockets".to_string()),
            if_device: options
                .if_device
                .clone()
                .or(file.if_device)
                .unwrap_or_default(),
            thread_model: options
                .thread_model
                .or(file.thread_model)
                .unwrap_or(ThreadModel::Serialize),
            context_model: options
                .context_model
                .or(file.context_model)
                .unwrap_or(ContextModel::Default),
            openfam_model: options
                .openfam_model
                .or(file.openfam_model)
                .unwrap_or(FamModel::SharedMemory),
            cis_interface_type: options
                .cis_interface_type
                .or(file.cis_interface_type)
                .unwrap_or(CisInterfaceType::Direct),
            runtime: options
                .runtime
                .or(file.runtime)
                .unwrap_or(PeRuntimeKind::None),
            num_consumer: options.num_consumer.or(file.num_consumer).unwrap_or(1),
            default_memory_type: options
                .default_memory_type
                .or(file.default_memory_type)
                .unwrap_or(MemoryType::Volatile),
            rpc_framework_type: options
                .rpc_framework_type
                .or(file.rpc_framework_type)
                .unwrap_or(RpcFrameworkType::Grpc),
            resource_release: options
                .resource_release
                .or(file.resource_release.map(Switch::as_bool))
                .unwrap_or(true),
            local_buf: match (options.local_buf_addr, options.local_buf_size) {
                (Some(addr), Some(size)) => Some((addr, size)),
                _ => None,
            },
            num_memory_servers: options
                .num_memory_servers
                .or(file.num_memory_servers)
                .unwrap_or(1),
            memory_per_server: options
                .memory_per_server
                .or(file.memory_per_server)
                .unwrap_or(64 * 1024 * 1024),
            interleave_size: options
                .interleave_size
                .or(file.interleave_size)
                .unwrap_or(1024 * 1024),
            backup_path: options
                .backup_path
                .clone()
                .or(file.backup_path)
                .unwrap_or_else(default_backup_path),
        };

        if config.num_consumer == 0 {
            return Err(FamError::invalid("num_consumer must be at least 1"));
        }
        if config.num_memory_servers == 0 {
            return Err(FamError::invalid("num_memory_servers must be at least 1"));
        }
        if !config.interleave_size.is_power_of_two()
            || config.interleave_size < crate::transport::MAX_ATOMIC_WIDTH
        {
            return Err(FamError::invalid(
                "interleave_size must be a power of two no smaller than the widest atomic scalar",
            ));
        }
        Ok(config)
    }
}

fn default_backup_path() -> PathBuf {
    std::env::temp_dir().join(format!("fam_backup_{}", std::process::id()))
}

fn discover_config_file() -> FamResult<ConfigFile> {
    let path = match std::env::var_os("FAM_CONFIG_FILE") {
        Some(p) => PathBuf::from(p),
        None => {
            let default = Path::new("fam_config.yaml");
            if !default.exists() {
                return Ok(ConfigFile::default());
            }
            default.to_path_buf()
        }
    };
    let contents = std::fs::read_to_string(&path).map_err(|e| {
        FamError::invalid(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    parse_config_file(&contents)
}

fn parse_config_file(contents: &str) -> FamResult<ConfigFile> {
    serde_yaml::from_str(contents)
        .map_err(|e| FamError::invalid(format!("invalid config file: {}", e)))
}
