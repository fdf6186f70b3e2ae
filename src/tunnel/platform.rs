//! Raw packet I/O capability probe
//!
//! The engine itself only needs a UDP socket, but a tunnel is useless
//! without somewhere to read and write IP packets. This reports whether the
//! platform can provide that.

/// Can this host provide raw packet I/O to a tunnel?
pub fn packet_io_supported() -> bool {
    unsupported_reason().is_none()
}

/// Why raw packet I/O is unavailable, if it is
pub fn unsupported_reason() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        if !std::path::Path::new("/dev/net/tun").exists() {
            return Some("/dev/net/tun does not exist".to_string());
        }
        if !is_privileged() {
            // Not fatal: CAP_NET_ADMIN may still be granted to the binary
            tracing::debug!("Running without root. Opening a TUN device needs CAP_NET_ADMIN.");
        }
        None
    }

    #[cfg(target_os = "macos")]
    {
        if !is_privileged() {
            tracing::debug!("Running without root. utun creation needs sudo on macOS.");
        }
        None
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Some(format!("no packet I/O backend for {}", std::env::consts::OS))
    }
}

#[cfg(unix)]
fn is_privileged() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}
