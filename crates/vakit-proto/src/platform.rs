use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9877;

/// IPC endpoint name for one mpv instance.  Every pipeline gets its own
/// instance, so the sequence number keeps concurrent players (radio and the
/// reminder sound) apart.
#[cfg(unix)]
pub fn mpv_socket_name(seq: u64) -> String {
    format!(
        "{}/vakit-mpv-{}-{}.sock",
        std::env::temp_dir().display(),
        std::process::id(),
        seq
    )
}

#[cfg(windows)]
pub fn mpv_socket_name(seq: u64) -> String {
    format!("vakit-mpv-{}-{}", std::process::id(), seq)
}

#[cfg(unix)]
pub fn mpv_socket_arg(name: &str) -> String {
    format!("--input-ipc-server={}", name)
}

#[cfg(windows)]
pub fn mpv_socket_arg(name: &str) -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", name)
}

pub fn data_dir() -> PathBuf {
    // ~/.local/share/vakit on unix-likes, including macOS
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("vakit")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vakit")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("vakit")
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vakit")
    }
}

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

fn find_beside_exe(name: &str) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    let p = dir.join(name);
    if p.exists() {
        return Some(p);
    }
    let p = dir.join("external").join(name);
    if p.exists() {
        return Some(p);
    }
    None
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    #[cfg(unix)]
    let sep = ":";
    #[cfg(windows)]
    let sep = ";";
    path.split(sep)
        .map(|dir| PathBuf::from(dir).join(name))
        .find(|p| p.exists())
}

/// Find the mpv binary used for stream and reminder playback.
///
/// Searches in order:
/// 1. MPV_PATH environment variable
/// 2. Beside the current executable (or its `external/` folder)
/// 3. PATH
pub fn find_mpv_binary() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("MPV_PATH") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(p) = find_beside_exe(mpv_binary_name()) {
        return Some(p);
    }

    find_on_path(mpv_binary_name())
}
