use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Separator between classpath entries on every runtime we drive.
pub const CLASSPATH_SEPARATOR: &str = ":";

/// One program launch on a Dalvik/ART style VM. Built once through
/// [`VmInvocationBuilder`] and never mutated afterwards; the same value can
/// be rendered for a local launcher or for a device with relocated files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInvocation {
    vm_options: Vec<String>,
    system_properties: BTreeMap<String, String>,
    classpath: Vec<PathBuf>,
    boot_classpath: Vec<PathBuf>,
    main_class: String,
    program_arguments: Vec<String>,
}

impl VmInvocation {
    #[must_use]
    pub fn builder(main_class: impl Into<String>) -> VmInvocationBuilder {
        VmInvocationBuilder {
            invocation: Self {
                vm_options: Vec::new(),
                system_properties: BTreeMap::new(),
                classpath: Vec::new(),
                boot_classpath: Vec::new(),
                main_class: main_class.into(),
                program_arguments: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn vm_options(&self) -> &[String] {
        &self.vm_options
    }

    #[must_use]
    pub fn system_properties(&self) -> &BTreeMap<String, String> {
        &self.system_properties
    }

    #[must_use]
    pub fn classpath(&self) -> &[PathBuf] {
        &self.classpath
    }

    #[must_use]
    pub fn boot_classpath(&self) -> &[PathBuf] {
        &self.boot_classpath
    }

    #[must_use]
    pub fn main_class(&self) -> &str {
        &self.main_class
    }

    #[must_use]
    pub fn program_arguments(&self) -> &[String] {
        &self.program_arguments
    }

    /// VM arguments (everything after the binary) using the host paths.
    #[must_use]
    pub fn arguments(&self) -> Vec<String> {
        let classpath = self.classpath.iter().map(|p| display_path(p)).collect::<Vec<_>>();
        let boot = self
            .boot_classpath
            .iter()
            .map(|p| display_path(p))
            .collect::<Vec<_>>();
        self.arguments_with(&classpath, &boot)
    }

    /// VM arguments with the classpath entries replaced by the given
    /// locations, in order `[options] [-Dk=v] [-cp ..] [-Xbootclasspath:..]
    /// main [args]`.
    #[must_use]
    pub fn arguments_with(&self, classpath: &[String], boot_classpath: &[String]) -> Vec<String> {
        let mut args = self.vm_options.clone();
        args.extend(
            self.system_properties
                .iter()
                .map(|(key, value)| format!("-D{key}={value}")),
        );
        if !classpath.is_empty() {
            args.push("-cp".to_owned());
            args.push(classpath.join(CLASSPATH_SEPARATOR));
        }
        if !boot_classpath.is_empty() {
            args.push(format!(
                "-Xbootclasspath:{}",
                boot_classpath.join(CLASSPATH_SEPARATOR)
            ));
        }
        args.push(self.main_class.clone());
        args.extend(self.program_arguments.iter().cloned());
        args
    }
}

#[derive(Debug, Clone)]
pub struct VmInvocationBuilder {
    invocation: VmInvocation,
}

impl VmInvocationBuilder {
    #[must_use]
    pub fn vm_option(mut self, option: impl Into<String>) -> Self {
        self.invocation.vm_options.push(option.into());
        self
    }

    #[must_use]
    pub fn system_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.invocation
            .system_properties
            .insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn classpath(mut self, entries: impl IntoIterator<Item = PathBuf>) -> Self {
        self.invocation.classpath.extend(entries);
        self
    }

    #[must_use]
    pub fn boot_classpath(mut self, entries: impl IntoIterator<Item = PathBuf>) -> Self {
        self.invocation.boot_classpath.extend(entries);
        self
    }

    #[must_use]
    pub fn program_argument(mut self, argument: impl Into<String>) -> Self {
        self.invocation.program_arguments.push(argument.into());
        self
    }

    #[must_use]
    pub fn build(self) -> VmInvocation {
        self.invocation
    }
}

/// Joins a device directory and a file name with a single `/`.
#[must_use]
pub fn target_join(directory: &str, name: &str) -> String {
    format!("{}/{}", directory.trim_end_matches('/'), name)
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{VmInvocation, target_join};

    fn invocation() -> VmInvocation {
        VmInvocation::builder("Main")
            .vm_option("-Xcompiler-option")
            .vm_option("--debuggable")
            .system_property("java.library.path", "/libs")
            .classpath([PathBuf::from("/out/classes.dex"), PathBuf::from("/out/classes2.dex")])
            .boot_classpath([PathBuf::from("/art/core.jar")])
            .program_argument("arttest")
            .build()
    }

    #[test]
    fn arguments_follow_vm_layout() {
        assert_eq!(
            invocation().arguments(),
            vec![
                "-Xcompiler-option",
                "--debuggable",
                "-Djava.library.path=/libs",
                "-cp",
                "/out/classes.dex:/out/classes2.dex",
                "-Xbootclasspath:/art/core.jar",
                "Main",
                "arttest",
            ]
        );
    }

    #[test]
    fn relocated_arguments_replace_paths_only() {
        let args = invocation().arguments_with(&["/data/t/f1_classes.dex".to_owned()], &[]);
        assert!(args.contains(&"/data/t/f1_classes.dex".to_owned()));
        assert!(!args.iter().any(|arg| arg.starts_with("-Xbootclasspath")));
        assert_eq!(args.last().map(String::as_str), Some("arttest"));
    }

    #[test]
    fn empty_classpaths_are_omitted() {
        let args = VmInvocation::builder("Main").build().arguments();
        assert_eq!(args, vec!["Main"]);
    }

    #[test]
    fn target_join_uses_a_single_separator() {
        assert_eq!(target_join("/data/dd-tests-1", "x.dex"), "/data/dd-tests-1/x.dex");
        assert_eq!(target_join("/data/dir/", "exitStatus"), "/data/dir/exitStatus");
    }
}
