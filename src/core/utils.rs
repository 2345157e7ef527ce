use socket2::SockRef;
use std::path::{Path, PathBuf};

pub fn get_system_name() -> String {
    let username = whoami::username();
    if matches!(
        username.as_str(),
        "user" | "root" | "ubuntu" | "admin" | "raspberry"
    ) {
        return whoami::devicename();
    }
    username
}

/// Widens kernel socket buffers to 2 MiB and disables Nagle's algorithm,
/// matched to the bandwidth-delay product of a typical Wi-Fi link.
pub fn apply_wifi_tuning(stream: &tokio::net::TcpStream) -> anyhow::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_send_buffer_size(2 * 1024 * 1024)?;
    socket.set_recv_buffer_size(2 * 1024 * 1024)?;
    socket.set_nodelay(true)?;
    Ok(())
}

/// Deterministic collision rule (§4.8/§8): `a.txt` then `a (1).txt` then
/// `a (2).txt`, inserted before the extension. Replaces the teacher's
/// `_1`/nanosecond-timestamp scheme, which doesn't match this exactly.
pub fn get_unique_path(dir: &Path, raw_filename: &str) -> PathBuf {
    let safe_filename = Path::new(raw_filename)
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown_file".to_string());

    let base_path = dir.join(&safe_filename);
    if !base_path.exists() {
        return base_path;
    }

    let stem = Path::new(&safe_filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&safe_filename)
        .to_string();
    let ext = Path::new(&safe_filename)
        .extension()
        .and_then(|s| s.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();

    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{} ({}){}", stem, n, ext));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as std_fs;

    #[test]
    fn unique_path_returns_base_when_absent() {
        let dir = std::env::temp_dir();
        let name = format!("opendrop-test-{}.txt", uuid::Uuid::new_v4());
        let path = get_unique_path(&dir, &name);
        assert_eq!(path, dir.join(&name));
    }

    #[test]
    fn unique_path_increments_parenthesized_counter() {
        let dir = std::env::temp_dir().join(format!("opendrop-unique-{}", uuid::Uuid::new_v4()));
        std_fs::create_dir_all(&dir).unwrap();

        std_fs::write(dir.join("a.txt"), b"x").unwrap();
        std_fs::write(dir.join("a (1).txt"), b"x").unwrap();

        let next = get_unique_path(&dir, "a.txt");
        assert_eq!(next, dir.join("a (2).txt"));

        let _ = std_fs::remove_dir_all(&dir);
    }

    #[test]
    fn unique_path_sanitizes_to_basename_only() {
        let dir = std::env::temp_dir();
        let path = get_unique_path(&dir, "../../etc/passwd");
        assert_eq!(path, dir.join("passwd"));
    }
}
