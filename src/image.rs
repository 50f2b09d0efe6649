//! Base image cache and per-instance working copies.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::console::{ConsoleOpener, Prompt};
use crate::error::{ProvisionError, Result};
use crate::executor::{HostCommand, HostExecutor};
use crate::settings::{ImageDescriptor, Timings};
use crate::vm::DeviceFamily;

/// ssh options for the image transfer; the image host is a throwaway lab box.
const SSH_TRANSPORT: &str = "ssh -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no";

/// Top-level directory inside the vMX bundle.
const BUNDLE_ROOT: &str = "vmx";

fn staging_failed(image: &ImageDescriptor, reason: impl Into<String>) -> ProvisionError {
    ProvisionError::ImageStagingFailed {
        image: image.local_name.clone(),
        reason: reason.into(),
    }
}

/// The rsync invocation that fetches `image` into its cache path.
pub fn fetch_command(image: &ImageDescriptor) -> HostCommand {
    HostCommand::new("rsync").args([
        "-e".to_string(),
        SSH_TRANSPORT.to_string(),
        format!("{}@{}", image.user, image.source),
        image.local_path().to_string_lossy().into_owned(),
    ])
}

pub struct ImageStager<'a> {
    exec: &'a dyn HostExecutor,
    opener: &'a dyn ConsoleOpener,
    timings: &'a Timings,
}

impl<'a> ImageStager<'a> {
    pub fn new(exec: &'a dyn HostExecutor, opener: &'a dyn ConsoleOpener, timings: &'a Timings) -> Self {
        Self {
            exec,
            opener,
            timings,
        }
    }

    /// Fetch the base image unless it is already cached. Returns the cache path.
    pub fn ensure_local_image(&self, image: &ImageDescriptor) -> Result<PathBuf> {
        let local = image.local_path();
        if local.exists() {
            info!(path = %local.display(), "using cached image");
            return Ok(local);
        }

        info!(source = %image.source, path = %local.display(), "fetching image");
        let cmd = fetch_command(image);
        let mut session = self
            .opener
            .open("rsync", &cmd)
            .map_err(|e| staging_failed(image, format!("cannot start transfer: {}", e)))?;

        if let Some(password) = &image.password {
            session
                .expect_one(&Prompt::literal("password:"), self.timings.prompt_timeout)
                .map_err(|e| staging_failed(image, e.to_string()))?;
            session
                .send_line(password)
                .map_err(|e| staging_failed(image, e.to_string()))?;
        }

        let status = session
            .wait_exit(self.timings.fetch_timeout)
            .map_err(|e| staging_failed(image, e.to_string()))?;
        match status {
            Some(0) => {}
            Some(code) => return Err(staging_failed(image, format!("transfer exited with {}", code))),
            None => return Err(staging_failed(image, "transfer was killed")),
        }
        if !local.exists() {
            return Err(staging_failed(image, "transfer finished but the image is missing"));
        }
        Ok(local)
    }

    /// Make the working copy for `instance`.
    ///
    /// Cisco: `<dir>/<instance>.qcow2`. Juniper: the bundle extracted into
    /// `<dir>/<instance>/` with its `vmx/` level removed.
    pub fn clone(&self, family: DeviceFamily, image: &ImageDescriptor, instance: &str) -> Result<PathBuf> {
        match family {
            DeviceFamily::Cisco => self.copy_disk(image, instance),
            DeviceFamily::Juniper => self.extract_bundle(image, instance),
        }
    }

    /// Refuses to touch an existing disk; it may belong to a running VM.
    fn copy_disk(&self, image: &ImageDescriptor, instance: &str) -> Result<PathBuf> {
        let target = image.local_dir.join(format!("{}.qcow2", instance));
        info!(from = %image.local_path().display(), to = %target.display(), "cloning disk");
        let mut dest = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .map_err(|e| staging_failed(image, format!("create {}: {}", target.display(), e)))?;
        let mut src = File::open(image.local_path())
            .map_err(|e| staging_failed(image, format!("open {}: {}", image.local_path().display(), e)))?;
        io::copy(&mut src, &mut dest)
            .map_err(|e| staging_failed(image, format!("copy to {}: {}", target.display(), e)))?;
        Ok(target)
    }

    fn extract_bundle(&self, image: &ImageDescriptor, instance: &str) -> Result<PathBuf> {
        let target = image.local_dir.join(instance);
        info!(to = %target.display(), "extracting bundle");
        fs::create_dir(&target)
            .map_err(|e| staging_failed(image, format!("create {}: {}", target.display(), e)))?;

        let tar = HostCommand::new("tar")
            .arg("-xf")
            .arg(image.local_path().to_string_lossy())
            .arg("-C")
            .arg(target.to_string_lossy());
        let result = self.exec.exec(&tar, self.timings.extract_timeout)?;
        if !result.success() {
            return Err(staging_failed(
                image,
                format!("tar exited with {}: {}", result.exit_code, result.errors),
            ));
        }

        flatten(&target.join(BUNDLE_ROOT), &target)
            .map_err(|e| staging_failed(image, format!("flatten bundle: {}", e)))?;
        Ok(target)
    }
}

/// Move everything in `nested` up into `into` and remove `nested`.
/// A bundle without the nested level is left alone.
fn flatten(nested: &Path, into: &Path) -> std::io::Result<()> {
    if !nested.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(nested)? {
        let entry = entry?;
        let dest = into.join(entry.file_name());
        debug!(from = %entry.path().display(), to = %dest.display(), "moving bundle entry");
        fs::rename(entry.path(), dest)?;
    }
    fs::remove_dir(nested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::{ConsoleError, ConsoleSession, PtyOpener};
    use crate::executor::SystemExecutor;
    use crate::testing::{RecordingExecutor, ScriptedOpener};
    use std::process::Command;
    use std::time::Duration;

    fn pty_timings() -> Timings {
        let mut timings = Timings::immediate();
        timings.prompt_timeout = Duration::from_secs(5);
        timings.fetch_timeout = Duration::from_secs(5);
        timings
    }

    fn descriptor(dir: &Path, name: &str) -> ImageDescriptor {
        ImageDescriptor {
            source: "imagehost:/srv/images/base.qcow2".to_string(),
            user: "lab".to_string(),
            password: Some("secret".to_string()),
            local_dir: dir.to_path_buf(),
            local_name: name.to_string(),
            image_size_gb: 1.0,
        }
    }

    /// Runs a shell script on a real pty in place of whatever was asked for.
    struct ShellOpener(String);

    impl ConsoleOpener for ShellOpener {
        fn open(&self, label: &str, _cmd: &HostCommand) -> std::result::Result<ConsoleSession, ConsoleError> {
            PtyOpener.open(label, &HostCommand::new("sh").args(["-c", self.0.as_str()]))
        }
    }

    #[test]
    fn test_fetch_command_shape() {
        let image = descriptor(Path::new("/var/lib/libvirt/images"), "base.qcow2");
        assert_eq!(
            fetch_command(&image).to_string(),
            "rsync -e 'ssh -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no' \
             lab@imagehost:/srv/images/base.qcow2 /var/lib/libvirt/images/base.qcow2"
        );
    }

    #[test]
    fn test_cached_image_is_not_fetched() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base.qcow2"), b"qcow").unwrap();
        let exec = RecordingExecutor::new();
        let opener = ScriptedOpener::new(Vec::new());
        let timings = Timings::immediate();
        let stager = ImageStager::new(&exec, &opener, &timings);

        let path = stager.ensure_local_image(&descriptor(dir.path(), "base.qcow2")).unwrap();
        assert_eq!(path, dir.path().join("base.qcow2"));
        assert!(opener.opened().is_empty());
    }

    #[test]
    fn test_fetch_answers_password_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("base.qcow2");
        let script = format!(
            "printf 'lab@imagehost password: '; read p; [ \"$p\" = secret ] && echo qcow > '{}'",
            dest.display()
        );
        let exec = RecordingExecutor::new();
        let opener = ShellOpener(script);
        let timings = pty_timings();
        let stager = ImageStager::new(&exec, &opener, &timings);

        let path = stager.ensure_local_image(&descriptor(dir.path(), "base.qcow2")).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap().trim(), "qcow");
    }

    #[test]
    fn test_failed_fetch_is_staging_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = RecordingExecutor::new();
        let opener = ShellOpener("printf 'password: '; read p; exit 23".to_string());
        let timings = pty_timings();
        let stager = ImageStager::new(&exec, &opener, &timings);

        let err = stager
            .ensure_local_image(&descriptor(dir.path(), "base.qcow2"))
            .unwrap_err();
        match err {
            ProvisionError::ImageStagingFailed { reason, .. } => assert!(reason.contains("23"), "{}", reason),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cisco_clone_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base.qcow2"), b"QFI\xfb disk").unwrap();
        let exec = RecordingExecutor::new();
        let opener = ScriptedOpener::new(Vec::new());
        let timings = Timings::immediate();
        let stager = ImageStager::new(&exec, &opener, &timings);

        let copy = stager
            .clone(DeviceFamily::Cisco, &descriptor(dir.path(), "base.qcow2"), "r1")
            .unwrap();
        assert_eq!(copy, dir.path().join("r1.qcow2"));
        assert_eq!(fs::read(copy).unwrap(), b"QFI\xfb disk");
    }

    #[test]
    fn test_existing_disk_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base.qcow2"), b"base").unwrap();
        fs::write(dir.path().join("r1.qcow2"), b"LIVE r1 DATA").unwrap();
        let exec = RecordingExecutor::new();
        let opener = ScriptedOpener::new(Vec::new());
        let timings = Timings::immediate();
        let stager = ImageStager::new(&exec, &opener, &timings);

        let err = stager
            .clone(DeviceFamily::Cisco, &descriptor(dir.path(), "base.qcow2"), "r1")
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ImageStagingFailed { .. }));
        assert_eq!(fs::read(dir.path().join("r1.qcow2")).unwrap(), b"LIVE r1 DATA");
    }

    #[test]
    fn test_juniper_bundle_is_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("vmx/images")).unwrap();
        fs::create_dir_all(src.join("vmx/config")).unwrap();
        fs::write(src.join("vmx/vmx.sh"), "#!/bin/sh\n").unwrap();
        fs::write(src.join("vmx/images/vmxhdd.img"), "hdd").unwrap();
        let status = Command::new("tar")
            .arg("-czf")
            .arg(dir.path().join("bundle.tgz"))
            .arg("-C")
            .arg(&src)
            .arg("vmx")
            .status()
            .unwrap();
        assert!(status.success());

        let opener = ScriptedOpener::new(Vec::new());
        let mut timings = Timings::immediate();
        timings.extract_timeout = Duration::from_secs(30);
        let stager = ImageStager::new(&SystemExecutor, &opener, &timings);

        let staged = stager
            .clone(DeviceFamily::Juniper, &descriptor(dir.path(), "bundle.tgz"), "r2")
            .unwrap();
        assert_eq!(staged, dir.path().join("r2"));
        assert!(staged.join("vmx.sh").is_file());
        assert!(staged.join("images/vmxhdd.img").is_file());
        assert!(staged.join("config").is_dir());
        assert!(!staged.join("vmx").exists());
    }

    #[test]
    fn test_existing_instance_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("r2")).unwrap();
        let exec = RecordingExecutor::new();
        let opener = ScriptedOpener::new(Vec::new());
        let timings = Timings::immediate();
        let stager = ImageStager::new(&exec, &opener, &timings);

        let err = stager
            .clone(DeviceFamily::Juniper, &descriptor(dir.path(), "bundle.tgz"), "r2")
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ImageStagingFailed { .. }));
        assert!(exec.calls().is_empty());
    }
}
