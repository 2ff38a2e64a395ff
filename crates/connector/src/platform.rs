//! Host platform identification.
//!
//! Helper registries are keyed by the classic platform names (`darwin`,
//! `win32`, `linux`), not by Rust's `target_os` names.

/// How a helper executable is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Executed directly by the OS loader (shebang scripts, binaries).
    Direct,
    /// Executed through the platform command shell (`cmd /C`).
    Shell,
}

impl ExecMode {
    /// Exec mode used for helpers on the given platform.
    pub fn for_platform(platform_id: &str) -> Self {
        if platform_id == "win32" {
            Self::Shell
        } else {
            Self::Direct
        }
    }
}

/// Platform id of the running host.
pub fn host_platform() -> &'static str {
    platform_id(std::env::consts::OS)
}

fn platform_id(os: &'static str) -> &'static str {
    match os {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}
