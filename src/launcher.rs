//! Command-line composition for the Eclipse JDT language server.
//!
//! Takes an existing JDT.LS installation directory and assembles the JVM
//! invocation: the equinox launcher jar from `plugins/`, the per-OS
//! configuration directory, a writable data directory, and an optional
//! Lombok agent. Installing the server is the operator's job.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;

const LAUNCHER_JAR_PREFIX: &str = "org.eclipse.equinox.launcher_";
const DEFAULT_DATA_DIR: &str = ".jdtls_data_cache";

#[derive(Debug, Clone)]
pub struct JdtlsLauncher {
    pub home: PathBuf,
    pub java_exec: String,
    pub lombok_jar: Option<PathBuf>,
    pub data_dir: PathBuf,
}

impl JdtlsLauncher {
    pub fn new(home: PathBuf) -> Self {
        Self {
            home,
            java_exec: "java".to_string(),
            lombok_jar: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }

    pub fn with_lombok(mut self, lombok_jar: Option<PathBuf>) -> Self {
        self.lombok_jar = lombok_jar;
        self
    }

    /// Assemble the child-process command. Creates the data directory.
    pub fn build_command(&self) -> Result<Command> {
        let launcher_jar = find_launcher_jar(&self.home.join("plugins"))?;
        let config_dir = self.config_dir();
        let data_dir = std::path::absolute(&self.data_dir)
            .unwrap_or_else(|_| self.data_dir.clone());
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let mut command = Command::new(&self.java_exec);
        command.args([
            "-Declipse.application=org.eclipse.jdt.ls.core.id1",
            "-Dosgi.bundles.defaultStartLevel=4",
            "-Declipse.product=org.eclipse.jdt.ls.core.product",
            "-Dlog.level=ALL",
            "-Xmx4G",
            "--add-modules=ALL-SYSTEM",
            "--add-opens",
            "java.base/java.util=ALL-UNNAMED",
            "--add-opens",
            "java.base/java.lang=ALL-UNNAMED",
            "--add-opens",
            "java.base/java.util.concurrent=ALL-UNNAMED",
            "--add-opens",
            "java.base/java.io=ALL-UNNAMED",
        ]);

        if let Some(lombok) = &self.lombok_jar {
            command.arg(format!("-javaagent:{}", lombok.display()));
            // Newer JDK/Lombok pairings also want the bootclasspath entry.
            command.arg(format!("-Xbootclasspath/a:{}", lombok.display()));
        }

        command
            .arg("-jar")
            .arg(launcher_jar)
            .arg("-configuration")
            .arg(config_dir)
            .arg("-data")
            .arg(data_dir);
        Ok(command)
    }

    fn config_dir(&self) -> PathBuf {
        let name = if cfg!(target_os = "windows") {
            "config_win"
        } else if cfg!(target_os = "macos") {
            "config_mac"
        } else {
            "config_linux"
        };
        self.home.join(name)
    }
}

fn find_launcher_jar(plugins_dir: &Path) -> Result<PathBuf> {
    let entries = std::fs::read_dir(plugins_dir)
        .with_context(|| format!("failed to read plugins directory {}", plugins_dir.display()))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(LAUNCHER_JAR_PREFIX) && name.ends_with(".jar") {
            return Ok(entry.path());
        }
    }
    bail!("launcher jar not found in {}", plugins_dir.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_find_launcher_jar() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        fs::create_dir(&plugins).unwrap();
        fs::write(plugins.join("org.eclipse.jdt.core.jar"), b"").unwrap();
        fs::write(
            plugins.join("org.eclipse.equinox.launcher_1.6.400.jar"),
            b"",
        )
        .unwrap();

        let jar = find_launcher_jar(&plugins).unwrap();
        assert!(jar
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(LAUNCHER_JAR_PREFIX));
    }

    #[test]
    fn test_missing_launcher_jar_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        fs::create_dir(&plugins).unwrap();
        assert!(find_launcher_jar(&plugins).is_err());
    }

    #[test]
    fn test_build_command_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("jdtls");
        let plugins = home.join("plugins");
        fs::create_dir_all(&plugins).unwrap();
        fs::write(plugins.join("org.eclipse.equinox.launcher_1.6.400.jar"), b"").unwrap();

        let mut launcher = JdtlsLauncher::new(home);
        launcher.data_dir = dir.path().join("data");
        launcher.build_command().unwrap();
        assert!(launcher.data_dir.is_dir());
    }
}
