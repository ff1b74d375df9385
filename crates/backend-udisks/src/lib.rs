use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use usbgate_common::backend::MountBackend;
use usbgate_common::config::{MitigationConfig, TARGET_PLACEHOLDER};
use usbgate_common::error::MitigationError;
use usbgate_common::types::{MountCommand, MountTarget};

/// Mount backend that shells out to an external tool, `udisksctl` by default.
#[derive(Debug, Clone)]
pub struct UdisksBackend {
    unmount: Vec<String>,
    mount: Vec<String>,
}

impl Default for UdisksBackend {
    fn default() -> Self {
        Self::from_config(&MitigationConfig::default())
    }
}

impl UdisksBackend {
    pub fn new(unmount: Vec<String>, mount: Vec<String>) -> Self {
        Self { unmount, mount }
    }

    pub fn from_config(cfg: &MitigationConfig) -> Self {
        Self::new(cfg.unmount_command.clone(), cfg.mount_command.clone())
    }

    fn template(&self, command: MountCommand) -> &[String] {
        match command {
            MountCommand::Unmount => &self.unmount,
            MountCommand::Mount => &self.mount,
        }
    }

    /// Substitutes the target into the template and splits off the program.
    fn render(
        &self,
        command: MountCommand,
        target: &MountTarget,
    ) -> Result<(String, Vec<String>), MitigationError> {
        let mut argv = self
            .template(command)
            .iter()
            .map(|a| a.replace(TARGET_PLACEHOLDER, target.as_str()));
        let program = argv
            .next()
            .filter(|p| !p.is_empty())
            .ok_or(MitigationError::EmptyTemplate(command))?;
        Ok((program, argv.collect()))
    }
}

#[async_trait]
impl MountBackend for UdisksBackend {
    async fn invoke(
        &self,
        command: MountCommand,
        target: &MountTarget,
    ) -> Result<(), MitigationError> {
        let (program, args) = self.render(command, target)?;
        tracing::debug!(%command, mount_target = %target, %program, ?args, "running mitigation command");
        // kill_on_drop: a caller-side timeout dropping this future also reaps the child
        let out = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| MitigationError::Launch {
                program: program.clone(),
                source,
            })?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        if command == MountCommand::Unmount && reports_not_mounted(&stderr) {
            return Err(MitigationError::NotMounted(target.to_string()));
        }
        Err(MitigationError::Exit {
            command,
            code: out.status.code(),
            stderr,
        })
    }
}

/// Matches udisks' `Error.NotMounted` and util-linux umount's "not mounted".
fn reports_not_mounted(stderr: &str) -> bool {
    stderr.contains("UDisks2.Error.NotMounted") || stderr.to_ascii_lowercase().contains("not mounted")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn renders_default_templates() {
        let backend = UdisksBackend::default();
        let target = MountTarget::new("/dev/sdb1");
        let (program, args) = backend.render(MountCommand::Unmount, &target).unwrap();
        assert_eq!(program, "udisksctl");
        assert_eq!(args, argv(&["unmount", "--no-user-interaction", "-b", "/dev/sdb1"]));
        let (_, args) = backend.render(MountCommand::Mount, &target).unwrap();
        assert_eq!(args[0], "mount");
        assert_eq!(args.last().map(String::as_str), Some("/dev/sdb1"));
    }

    #[test]
    fn placeholder_inside_argument() {
        let backend = UdisksBackend::new(argv(&["umount", "--target={target}"]), vec![]);
        let (_, args) = backend
            .render(MountCommand::Unmount, &MountTarget::new("/dev/sdc"))
            .unwrap();
        assert_eq!(args, argv(&["--target=/dev/sdc"]));
    }

    #[test]
    fn empty_template_is_an_error() {
        let backend = UdisksBackend::new(argv(&["true"]), vec![]);
        let err = backend
            .render(MountCommand::Mount, &MountTarget::new("/dev/sdb1"))
            .unwrap_err();
        assert!(matches!(err, MitigationError::EmptyTemplate(MountCommand::Mount)));
    }

    #[tokio::test]
    async fn successful_command() {
        let backend = UdisksBackend::new(argv(&["true", "{target}"]), vec![]);
        backend
            .invoke(MountCommand::Unmount, &MountTarget::new("/dev/sdb1"))
            .await
            .expect("true succeeds");
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let backend = UdisksBackend::new(
            argv(&["sh", "-c", "echo 'target is busy' >&2; exit 3", "{target}"]),
            vec![],
        );
        let err = backend
            .invoke(MountCommand::Unmount, &MountTarget::new("/dev/sdb1"))
            .await
            .unwrap_err();
        match err {
            MitigationError::Exit {
                command,
                code,
                stderr,
            } => {
                assert_eq!(command, MountCommand::Unmount);
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "target is busy");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn not_mounted_messages() {
        assert!(reports_not_mounted(
            "Error unmounting /dev/sdb1: GDBus.Error:org.freedesktop.UDisks2.Error.NotMounted: Device `/dev/sdb1' is not mounted"
        ));
        assert!(reports_not_mounted("umount: /dev/sdb1: not mounted."));
        assert!(!reports_not_mounted("umount: /media/stick: target is busy."));
    }

    #[tokio::test]
    async fn unmount_of_unmounted_target_is_not_mounted() {
        let backend = UdisksBackend::new(
            argv(&[
                "sh",
                "-c",
                "echo \"Error unmounting $0: GDBus.Error:org.freedesktop.UDisks2.Error.NotMounted: Device is not mounted\" >&2; exit 1",
                "{target}",
            ]),
            vec![],
        );
        let err = backend
            .invoke(MountCommand::Unmount, &MountTarget::new("/dev/sdb1"))
            .await
            .unwrap_err();
        match err {
            MitigationError::NotMounted(target) => assert_eq!(target, "/dev/sdb1"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn mount_failure_mentioning_not_mounted_stays_an_exit_error() {
        let backend = UdisksBackend::new(
            vec![],
            argv(&["sh", "-c", "echo 'not mounted' >&2; exit 1"]),
        );
        let err = backend
            .invoke(MountCommand::Mount, &MountTarget::new("/dev/sdb1"))
            .await
            .unwrap_err();
        assert!(matches!(err, MitigationError::Exit { command: MountCommand::Mount, .. }));
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let backend = UdisksBackend::new(argv(&["/nonexistent/usbgate-umount"]), vec![]);
        let err = backend
            .invoke(MountCommand::Unmount, &MountTarget::new("/dev/sdb1"))
            .await
            .unwrap_err();
        assert!(matches!(err, MitigationError::Launch { .. }));
    }
}
