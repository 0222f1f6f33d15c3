//! MCP transport descriptor factory (spec §4.8).
//!
//! Grounded on `other_examples/mcpmux-mcp-mux/.../transports.rs`'s
//! `TransportConfig` enum (Stdio vs Http), adapted to the three backend
//! kinds (C11) this crate dispatches over instead of arbitrary server
//! configs.

use crate::backend::BackendKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpTransportDescriptor {
    Stdio { cmd: String, args: Vec<String> },
    Http { url: String, auth_token: Option<String>, root_dir: String, scope_path: Option<String> },
}

#[derive(Debug, Clone, Default)]
pub struct DaemonLaunchOptions {
    pub isolation: Option<String>,
    pub shell: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteDescriptorArgs {
    pub url: String,
    pub auth_token: Option<String>,
    pub scope_path: Option<String>,
}

/// Build the descriptor spec §4.8 names for `kind`. `remote` is required
/// (and only consulted) when `kind` is `RemoteFilesystem`.
pub fn build_descriptor(
    kind: BackendKind,
    daemon_cli: &str,
    root_dir: &str,
    launch: &DaemonLaunchOptions,
    remote: Option<&RemoteDescriptorArgs>,
) -> McpTransportDescriptor {
    match kind {
        BackendKind::Memory => McpTransportDescriptor::Stdio {
            cmd: daemon_cli.to_string(),
            args: vec![
                "--backend".to_string(),
                "memory".to_string(),
                "--rootDir".to_string(),
                root_dir.to_string(),
            ],
        },
        BackendKind::LocalFilesystem => {
            let mut args = vec![
                "daemon".to_string(),
                "--rootDir".to_string(),
                root_dir.to_string(),
                "--local-only".to_string(),
            ];
            if let Some(isolation) = &launch.isolation {
                args.push("--isolation".to_string());
                args.push(isolation.clone());
            }
            if let Some(shell) = &launch.shell {
                args.push("--shell".to_string());
                args.push(shell.clone());
            }
            McpTransportDescriptor::Stdio { cmd: daemon_cli.to_string(), args }
        }
        BackendKind::RemoteFilesystem => {
            let remote = remote.expect("remote backend requires RemoteDescriptorArgs");
            McpTransportDescriptor::Http {
                url: remote.url.clone(),
                auth_token: remote.auth_token.clone(),
                root_dir: root_dir.to_string(),
                scope_path: remote.scope_path.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_gets_memory_stdio_descriptor() {
        let d = build_descriptor(
            BackendKind::Memory,
            "agent-backend",
            "/ws",
            &DaemonLaunchOptions::default(),
            None,
        );
        assert_eq!(
            d,
            McpTransportDescriptor::Stdio {
                cmd: "agent-backend".to_string(),
                args: vec![
                    "--backend".to_string(),
                    "memory".to_string(),
                    "--rootDir".to_string(),
                    "/ws".to_string(),
                ],
            }
        );
    }

    #[test]
    fn local_backend_gets_daemon_stdio_descriptor_with_flags() {
        let launch = DaemonLaunchOptions {
            isolation: Some("none".to_string()),
            shell: Some("bash".to_string()),
        };
        let d = build_descriptor(BackendKind::LocalFilesystem, "agent-backend", "/ws", &launch, None);
        assert_eq!(
            d,
            McpTransportDescriptor::Stdio {
                cmd: "agent-backend".to_string(),
                args: vec![
                    "daemon".to_string(),
                    "--rootDir".to_string(),
                    "/ws".to_string(),
                    "--local-only".to_string(),
                    "--isolation".to_string(),
                    "none".to_string(),
                    "--shell".to_string(),
                    "bash".to_string(),
                ],
            }
        );
    }

    #[test]
    fn local_backend_without_optional_flags_omits_them() {
        let d = build_descriptor(
            BackendKind::LocalFilesystem,
            "agent-backend",
            "/ws",
            &DaemonLaunchOptions::default(),
            None,
        );
        assert_eq!(
            d,
            McpTransportDescriptor::Stdio {
                cmd: "agent-backend".to_string(),
                args: vec![
                    "daemon".to_string(),
                    "--rootDir".to_string(),
                    "/ws".to_string(),
                    "--local-only".to_string(),
                ],
            }
        );
    }

    #[test]
    fn remote_backend_gets_http_descriptor_with_headers_payload() {
        let remote = RemoteDescriptorArgs {
            url: "https://daemon.example".to_string(),
            auth_token: Some("tok".to_string()),
            scope_path: Some("proj".to_string()),
        };
        let d = build_descriptor(
            BackendKind::RemoteFilesystem,
            "agent-backend",
            "/ws/proj",
            &DaemonLaunchOptions::default(),
            Some(&remote),
        );
        assert_eq!(
            d,
            McpTransportDescriptor::Http {
                url: "https://daemon.example".to_string(),
                auth_token: Some("tok".to_string()),
                root_dir: "/ws/proj".to_string(),
                scope_path: Some("proj".to_string()),
            }
        );
    }

    #[test]
    #[should_panic(expected = "remote backend requires")]
    fn remote_backend_without_args_panics() {
        build_descriptor(
            BackendKind::RemoteFilesystem,
            "agent-backend",
            "/ws",
            &DaemonLaunchOptions::default(),
            None,
        );
    }
}
