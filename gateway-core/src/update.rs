//! Real [`crate::session::SystemActions`] implementation used by
//! `gatewayd`: unpacks an UPDATE zip package onto the filesystem and shells
//! out to `systemctl`/`reboot` for service lifecycle changes.
//!
//! Kept separate from [`crate::session`] so the state machine itself never
//! touches the filesystem or a process table directly.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::process::Command;

use tracing::{error, info, warn};
use zip::ZipArchive;

use crate::session::SystemActions;

pub struct ProcessSystemActions {
    install_root: PathBuf,
    updates_dir: PathBuf,
    service_name: String,
}

impl ProcessSystemActions {
    pub fn new(install_root: PathBuf, service_name: impl Into<String>) -> Self {
        let updates_dir = install_root.join("updates");
        Self {
            install_root,
            updates_dir,
            service_name: service_name.into(),
        }
    }
}

impl SystemActions for ProcessSystemActions {
    fn restart_service(&self) {
        info!(service = %self.service_name, "restarting service");
        if let Err(e) = Command::new("systemctl")
            .args(["restart", &self.service_name])
            .status()
        {
            error!(error = %e, "failed to invoke systemctl restart");
        }
    }

    fn reboot(&self) {
        info!("rebooting host");
        if let Err(e) = Command::new("reboot").status() {
            error!(error = %e, "failed to invoke reboot");
        }
    }

    fn install_update(&self, name: &str, content: &[u8]) -> Result<(), String> {
        std::fs::create_dir_all(&self.updates_dir).map_err(|e| e.to_string())?;
        let package_path = self.updates_dir.join(name);
        info!(name, bytes = content.len(), path = %package_path.display(), "writing update package");
        std::fs::write(&package_path, content).map_err(|e| e.to_string())?;

        info!(name, "unpacking update package");
        let file = File::open(&package_path).map_err(|e| e.to_string())?;
        let mut archive =
            ZipArchive::new(file).map_err(|e| format!("not a valid zip archive: {e}"))?;

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| format!("failed to read archive entry {index}: {e}"))?;
            let Some(relative_path) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
                warn!(name, entry = entry.name(), "skipping update entry with unsafe path");
                continue;
            };
            let target = self.install_root.join(relative_path);

            if entry.is_dir() {
                std::fs::create_dir_all(&target).map_err(|e| e.to_string())?;
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf).map_err(|e| e.to_string())?;
            std::fs::write(&target, &buf).map_err(|e| e.to_string())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_test_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options = zip::write::FileOptions::default();
            for (name, content) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn install_update_extracts_files_under_root() {
        let dir = std::env::temp_dir().join(format!("gateway-update-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let actions = ProcessSystemActions::new(dir.clone(), "magateway");

        let zip_bytes = build_test_zip(&[("agent/main.py", b"print('hi')")]);
        actions.install_update("1.2.3", &zip_bytes).unwrap();

        let extracted = dir.join("agent").join("main.py");
        assert!(extracted.exists());
        assert_eq!(std::fs::read(&extracted).unwrap(), b"print('hi')");

        let written_package = dir.join("updates").join("1.2.3");
        assert!(written_package.exists(), "raw package bytes should be written under the updates directory");
        assert_eq!(std::fs::read(&written_package).unwrap(), zip_bytes);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn install_update_rejects_non_zip_content() {
        let dir = std::env::temp_dir().join(format!("gateway-update-test-bad-{}", std::process::id()));
        let actions = ProcessSystemActions::new(dir, "magateway");
        let err = actions.install_update("bogus", b"not a zip").unwrap_err();
        assert!(err.contains("zip"));
    }
}
