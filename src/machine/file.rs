//! Machine file loading
//!
//! ```ini
//! [Machine]
//! Name=vm1
//! Emulator=qemu-system-x86_64
//! Arguments=-m 512 -hda disk.img
//! WorkingDirectory=/srv/vm1
//! Environment=QEMU_AUDIO_DRV=none
//! SaveTag=snap1
//! ```

use std::path::{Path, PathBuf};

use crate::ini::{self, ParseError};

const MACHINE_SECTION: &str = "[Machine]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineFile {
    /// Path the file was loaded from
    pub path: PathBuf,
    pub name: String,
    /// Emulator program, falls back to the service default when unset
    pub emulator: Option<String>,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub environment: Vec<(String, String)>,
    pub save_tag: Option<String>,
}

impl MachineFile {
    pub fn load(path: &Path) -> Result<Self, ParseError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(path, &content)
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, ParseError> {
        let mut parsed = ini::parse_file(content)?;
        let mut section = parsed
            .remove(MACHINE_SECTION)
            .ok_or_else(|| ParseError::MissingSection(MACHINE_SECTION.to_string()))?;

        let name = ini::single(&mut section, "NAME")?.unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        });

        let mut arguments = Vec::new();
        for raw in section.remove("ARGUMENTS").unwrap_or_default() {
            let parts = shlex::split(&raw)
                .ok_or_else(|| ParseError::InvalidValue("Arguments".into(), raw.clone()))?;
            arguments.extend(parts);
        }

        let mut environment = Vec::new();
        for raw in section.remove("ENVIRONMENT").unwrap_or_default() {
            let (key, value) = raw
                .split_once('=')
                .ok_or_else(|| ParseError::InvalidValue("Environment".into(), raw.clone()))?;
            environment.push((key.trim().to_string(), value.trim().to_string()));
        }

        let file = Self {
            path: path.to_path_buf(),
            name,
            emulator: ini::single(&mut section, "EMULATOR")?,
            arguments,
            working_directory: ini::single(&mut section, "WORKINGDIRECTORY")?.map(PathBuf::from),
            environment,
            save_tag: ini::single(&mut section, "SAVETAG")?,
        };

        for key in section.keys() {
            log::debug!("{}: ignoring unknown machine setting {}", path.display(), key);
        }

        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let file = MachineFile::parse(
            Path::new("/vms/vm1.vm"),
            r#"
[Machine]
Name=Debian
Emulator=qemu-system-x86_64
Arguments=-m 512 -name "my vm"
Arguments=-drive file=disk.img,if=virtio
WorkingDirectory=/srv/vm1
Environment=QEMU_AUDIO_DRV=none
SaveTag=snap1
"#,
        )
        .unwrap();

        assert_eq!(file.name, "Debian");
        assert_eq!(file.emulator.as_deref(), Some("qemu-system-x86_64"));
        assert_eq!(
            file.arguments,
            vec!["-m", "512", "-name", "my vm", "-drive", "file=disk.img,if=virtio"]
        );
        assert_eq!(file.working_directory, Some(PathBuf::from("/srv/vm1")));
        assert_eq!(
            file.environment,
            vec![("QEMU_AUDIO_DRV".to_string(), "none".to_string())]
        );
        assert_eq!(file.save_tag.as_deref(), Some("snap1"));
    }

    #[test]
    fn test_name_defaults_to_file_stem() {
        let file = MachineFile::parse(Path::new("/vms/router.vm"), "[Machine]\n").unwrap();
        assert_eq!(file.name, "router");
        assert!(file.emulator.is_none());
        assert!(file.arguments.is_empty());
    }

    #[test]
    fn test_missing_section() {
        let result = MachineFile::parse(Path::new("x.vm"), "[Service]\nA=b\n");
        assert!(matches!(result, Err(ParseError::MissingSection(_))));
    }

    #[test]
    fn test_unbalanced_quotes() {
        let result = MachineFile::parse(Path::new("x.vm"), "[Machine]\nArguments=-name \"oops\n");
        assert!(matches!(result, Err(ParseError::InvalidValue(..))));
    }

    #[test]
    fn test_missing_file() {
        let result = MachineFile::load(Path::new("/nonexistent/vmsd/none.vm"));
        assert!(matches!(result, Err(ParseError::Io(_))));
    }
}
