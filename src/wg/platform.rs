//! Platform subprocess sequences for the overlay interface
//!
//! Linux drives `ip` and `wg`; macOS drives `wireguard-go`, `ifconfig`
//! and `wg`. Everything else reports `Unsupported`. Callers never see the
//! command lines, only `PlatformError`.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use tokio::process::Command;

use crate::error::PlatformError;

/// Verify the WireGuard toolchain is on PATH
pub async fn check_available() -> Result<(), PlatformError> {
    which("wg").await?;
    #[cfg(target_os = "macos")]
    which("wireguard-go").await?;
    Ok(())
}

async fn which(tool: &str) -> Result<(), PlatformError> {
    let status = Command::new("which")
        .arg(tool)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(PlatformError::NotInstalled {
            tool: tool.to_string(),
        })
    }
}

/// Refuse to run where interface creation cannot possibly succeed
pub fn check_privileges() -> Result<(), PlatformError> {
    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } != 0 {
            #[cfg(target_os = "linux")]
            {
                // CAP_NET_ADMIN may still be granted; the first ip command
                // will tell us for sure
                tracing::warn!("Running without root; interface creation may fail");
                tracing::warn!("Either run with sudo or grant CAP_NET_ADMIN:");
                tracing::warn!("  sudo setcap cap_net_admin=eip ./lanrage");
            }
            #[cfg(target_os = "macos")]
            {
                return Err(PlatformError::PermissionDenied {
                    message: "root privileges required on macOS, run with sudo".to_string(),
                });
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        Err(PlatformError::Unsupported {
            platform: std::env::consts::OS.to_string(),
        })
    }
}

/// Create the overlay interface, assign the host address, set MTU, up
pub async fn create_interface(
    name: &str,
    address: Ipv4Addr,
    prefix_len: u8,
    mtu: u16,
) -> Result<(), PlatformError> {
    #[cfg(target_os = "linux")]
    {
        match run("ip", &["link", "add", name, "type", "wireguard"]).await {
            Err(PlatformError::CommandFailed { stderr, .. }) if stderr.contains("File exists") => {
                return Err(PlatformError::InterfaceConflict {
                    name: name.to_string(),
                });
            }
            other => other?,
        }
        run(
            "ip",
            &[
                "address",
                "add",
                &format!("{address}/{prefix_len}"),
                "dev",
                name,
            ],
        )
        .await?;
        run(
            "ip",
            &["link", "set", "mtu", &mtu.to_string(), "up", "dev", name],
        )
        .await?;
        Ok(())
    }

    #[cfg(target_os = "macos")]
    {
        // wireguard-go refuses to start when the utun name is taken
        match run("wireguard-go", &[name]).await {
            Err(PlatformError::CommandFailed { stderr, .. })
                if stderr.contains("already exists") =>
            {
                return Err(PlatformError::InterfaceConflict {
                    name: name.to_string(),
                });
            }
            other => other?,
        }
        let addr = address.to_string();
        let netmask = ipnet::Ipv4Net::new(address, prefix_len)
            .map_err(|_| PlatformError::CommandFailed {
                command: format!("ifconfig {name}"),
                status: -1,
                stderr: format!("invalid prefix length {prefix_len}"),
            })?
            .netmask()
            .to_string();
        run(
            "ifconfig",
            &[name, "inet", &addr, &addr, "netmask", &netmask, "mtu", &mtu.to_string(), "up"],
        )
        .await?;
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = (name, address, prefix_len, mtu);
        Err(PlatformError::Unsupported {
            platform: std::env::consts::OS.to_string(),
        })
    }
}

/// Load the private key and listen port into the device
pub async fn configure_device(
    name: &str,
    private_key_file: &Path,
    listen_port: u16,
) -> Result<(), PlatformError> {
    let key_path = private_key_file.display().to_string();
    run(
        "wg",
        &[
            "set",
            name,
            "listen-port",
            &listen_port.to_string(),
            "private-key",
            &key_path,
        ],
    )
    .await
}

/// Upsert a peer entry
///
/// `wg set ... peer` replaces endpoint, allowed-ips and keepalive in place
/// for a known public key, leaving the established session untouched.
pub async fn apply_peer(
    name: &str,
    public_key: &str,
    endpoint: SocketAddr,
    allowed_ips: &str,
    persistent_keepalive: u16,
) -> Result<(), PlatformError> {
    run(
        "wg",
        &[
            "set",
            name,
            "peer",
            public_key,
            "endpoint",
            &endpoint.to_string(),
            "allowed-ips",
            allowed_ips,
            "persistent-keepalive",
            &persistent_keepalive.to_string(),
        ],
    )
    .await
}

/// Point an existing peer at a new outer endpoint, nothing else
pub async fn update_endpoint(
    name: &str,
    public_key: &str,
    endpoint: SocketAddr,
) -> Result<(), PlatformError> {
    run(
        "wg",
        &[
            "set",
            name,
            "peer",
            public_key,
            "endpoint",
            &endpoint.to_string(),
        ],
    )
    .await
}

pub async fn remove_peer(name: &str, public_key: &str) -> Result<(), PlatformError> {
    run("wg", &["set", name, "peer", public_key, "remove"]).await
}

pub async fn destroy_interface(name: &str) -> Result<(), PlatformError> {
    #[cfg(target_os = "linux")]
    {
        run("ip", &["link", "delete", name]).await
    }
    #[cfg(target_os = "macos")]
    {
        // killing the wireguard-go process tears the utun down with it
        run("pkill", &["-f", &format!("wireguard-go {name}")]).await
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = name;
        Err(PlatformError::Unsupported {
            platform: std::env::consts::OS.to_string(),
        })
    }
}

async fn run(program: &str, args: &[&str]) -> Result<(), PlatformError> {
    let output = Command::new(program).args(args).output().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PlatformError::NotInstalled {
                tool: program.to_string(),
            }
        } else {
            PlatformError::Io(e)
        }
    })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let command = format!("{program} {}", args.join(" "));
    if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
        return Err(PlatformError::PermissionDenied {
            message: format!("`{command}`: {stderr}"),
        });
    }
    Err(PlatformError::CommandFailed {
        command,
        status: output.status.code().unwrap_or(-1),
        stderr,
    })
}
