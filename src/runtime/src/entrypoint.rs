//! Process contract of the built image.
//!
//! The entrypoint stage only records metadata. What it checks is that the
//! advertised port matches the port the service is configured to listen on.

use std::collections::BTreeMap;

use a3s_bake_core::directive::ListenConfig;
use a3s_bake_core::error::{BakeError, Result};
use a3s_bake_core::RuntimeConfig;

use crate::rootfs::{resolve_path, Rootfs};

/// Ports declared by `keyword` lines of a configuration file.
///
/// `Listen 8080`, `Listen 0.0.0.0:8080` and `Listen [::]:8080 http` all
/// declare 8080. Comment lines are ignored.
pub fn declared_ports(content: &str, keyword: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some(first) if first.eq_ignore_ascii_case(keyword) => {}
            _ => continue,
        }
        let Some(address) = tokens.next() else {
            continue;
        };
        let port = address.rsplit(':').next().unwrap_or(address);
        if let Ok(port) = port.parse::<u16>() {
            if port != 0 && !ports.contains(&port) {
                ports.push(port);
            }
        }
    }
    ports
}

/// Verify `exposed` is among the ports configured in `listen.path`.
///
/// Returns the declared ports on success.
pub fn check_listen_consistency(
    rootfs: &Rootfs,
    listen: &ListenConfig,
    workdir: &str,
    exposed: u16,
) -> Result<Vec<u16>> {
    let path = resolve_path(workdir, &listen.path);
    let declared = match rootfs.read_file(&path) {
        Ok(data) => declared_ports(&String::from_utf8_lossy(data), &listen.keyword),
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "Listen configuration unreadable");
            Vec::new()
        }
    };

    if !declared.contains(&exposed) {
        return Err(BakeError::Consistency { exposed, declared });
    }
    tracing::debug!(path = %path, exposed, declared = ?declared, "Listening port consistent");
    Ok(declared)
}

/// Assemble the runtime contract. `command[0]` is the program; the rest of
/// `command` followed by `args` are its arguments.
pub fn runtime_config(
    listening_port: u16,
    working_directory: &str,
    command: &[String],
    args: &[String],
    env: BTreeMap<String, String>,
) -> Result<RuntimeConfig> {
    let (program, rest) = command.split_first().ok_or_else(|| {
        BakeError::InvalidDirective("entrypoint command is empty".to_string())
    })?;

    Ok(RuntimeConfig {
        listening_port,
        working_directory: working_directory.to_string(),
        entrypoint_command: program.clone(),
        entrypoint_args: rest.iter().chain(args.iter()).cloned().collect(),
        env,
    })
}
