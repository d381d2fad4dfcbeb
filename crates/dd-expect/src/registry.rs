use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use dd_types::{InputToolchain, RuntimeVersion};
use serde::{Deserialize, Serialize};

use crate::ExpectError;

/// The fixture corpus is versioned; old runtimes and the jack toolchain use
/// the older snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorpusSnapshot {
    Current,
    Legacy,
}

impl CorpusSnapshot {
    #[must_use]
    pub fn select(toolchain: InputToolchain, version: RuntimeVersion) -> Self {
        if toolchain == InputToolchain::LegacyDexer || version.is_legacy() {
            Self::Legacy
        } else {
            Self::Current
        }
    }
}

fn default_main_class() -> String {
    "Main".to_owned()
}

fn default_toolchains() -> BTreeSet<InputToolchain> {
    [InputToolchain::NoPreprocessing, InputToolchain::ExternalDexer]
        .into_iter()
        .collect()
}

fn default_snapshots() -> BTreeSet<CorpusSnapshot> {
    [CorpusSnapshot::Current, CorpusSnapshot::Legacy]
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureEntry {
    #[serde(default = "default_main_class")]
    pub main_class: String,
    #[serde(default = "default_toolchains")]
    pub toolchains: BTreeSet<InputToolchain>,
    #[serde(default = "default_snapshots")]
    pub snapshots: BTreeSet<CorpusSnapshot>,
}

impl Default for FixtureEntry {
    fn default() -> Self {
        Self {
            main_class: default_main_class(),
            toolchains: default_toolchains(),
            snapshots: default_snapshots(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureManifest {
    pub snapshots: BTreeMap<CorpusSnapshot, PathBuf>,
    #[serde(default)]
    pub tests: BTreeMap<String, FixtureEntry>,
}

/// Where one test's inputs, golden output and helpers live for one
/// toolchain and corpus snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureDescriptor {
    pub name: String,
    pub main_class: String,
    pub snapshot: CorpusSnapshot,
    pub directory: PathBuf,
    pub native_library_dir: PathBuf,
}

impl FixtureDescriptor {
    #[must_use]
    pub fn resolve_file(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    #[must_use]
    pub fn expected_output(&self) -> PathBuf {
        self.resolve_file("expected.txt")
    }

    /// Custom comparison executable, honored on unix hosts only.
    #[must_use]
    pub fn custom_check(&self) -> Option<PathBuf> {
        let check = self.resolve_file("check");
        (cfg!(unix) && check.is_file()).then_some(check)
    }

    /// The unprocessed program, used as a baseline when the golden text
    /// disagrees with the runtime at hand.
    #[must_use]
    pub fn original_jar(&self) -> Option<PathBuf> {
        let jar = self.resolve_file(&format!("{}.jar", self.name));
        jar.is_file().then_some(jar)
    }

    /// Program inputs the compiler under test consumes for `toolchain`.
    pub fn collect_inputs(&self, toolchain: InputToolchain) -> Result<Vec<PathBuf>, ExpectError> {
        if toolchain.is_pre_dexed() {
            let mut files = Vec::new();
            for entry in fs::read_dir(&self.directory)? {
                let path = entry?.path();
                let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                    continue;
                };
                if path.is_file() && file_name.ends_with(".dex") && !file_name.starts_with("jasmin")
                {
                    files.push(path);
                }
            }
            files.sort();
            return Ok(files);
        }

        let mut files = Vec::new();
        files.extend(file_tree(&self.resolve_file("classes"))?);
        files.extend(file_tree(&self.resolve_file("jasmin_classes"))?);
        let smali = self.resolve_file("smali");
        if smali.is_dir() {
            let smali_dex = smali.join("out.dex");
            if !smali_dex.is_file() {
                return Err(ExpectError::Manifest(format!(
                    "{} has smali sources but no out.dex",
                    self.name
                )));
            }
            files.push(smali_dex);
        }
        files.extend(file_tree(&self.resolve_file("classes2"))?);
        files.extend(file_tree(&self.resolve_file("jasmin_classes2"))?);
        Ok(files)
    }
}

/// Breadth-first listing of regular files; missing directories are empty.
fn file_tree(root: &Path) -> Result<Vec<PathBuf>, ExpectError> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let mut queue = VecDeque::from([root.to_path_buf()]);
    while let Some(current) = queue.pop_front() {
        let mut entries = fs::read_dir(&current)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort();
        for path in entries {
            if path.is_dir() {
                queue.push_back(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}

/// Explicit map from test name to its fixture entry, read from a manifest
/// instead of being discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureRegistry {
    root: PathBuf,
    manifest: FixtureManifest,
}

impl FixtureRegistry {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, manifest: FixtureManifest) -> Self {
        Self {
            root: root.into(),
            manifest,
        }
    }

    pub fn from_yaml_str(root: impl Into<PathBuf>, body: &str) -> Result<Self, ExpectError> {
        let manifest: FixtureManifest = serde_yaml::from_str(body)?;
        for snapshot in [CorpusSnapshot::Current, CorpusSnapshot::Legacy] {
            if !manifest.snapshots.contains_key(&snapshot) {
                return Err(ExpectError::Manifest(format!(
                    "fixture manifest has no directory for the {snapshot:?} snapshot"
                )));
            }
        }
        Ok(Self::new(root, manifest))
    }

    /// Relative snapshot directories in the manifest resolve against `root`.
    pub fn load(root: impl Into<PathBuf>, manifest_path: &Path) -> Result<Self, ExpectError> {
        Self::from_yaml_str(root, &fs::read_to_string(manifest_path)?)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.manifest.tests.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.manifest.tests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.manifest.tests.is_empty()
    }

    #[must_use]
    pub fn entry(&self, test: &str) -> Option<&FixtureEntry> {
        self.manifest.tests.get(test)
    }

    #[must_use]
    pub fn snapshot_dir(&self, snapshot: CorpusSnapshot) -> PathBuf {
        self.manifest
            .snapshots
            .get(&snapshot)
            .map_or_else(|| self.root.clone(), |dir| self.root.join(dir))
    }

    /// `None` when the test is not part of the snapshot that serves this
    /// toolchain and runtime version.
    #[must_use]
    pub fn lookup(
        &self,
        test: &str,
        toolchain: InputToolchain,
        version: RuntimeVersion,
    ) -> Option<FixtureDescriptor> {
        let entry = self.manifest.tests.get(test)?;
        let snapshot = CorpusSnapshot::select(toolchain, version);
        if !entry.toolchains.contains(&toolchain) || !entry.snapshots.contains(&snapshot) {
            return None;
        }
        let base = self.snapshot_dir(snapshot);
        let toolchain_dir = match toolchain {
            InputToolchain::LegacyDexer => "jack",
            InputToolchain::NoPreprocessing | InputToolchain::ExternalDexer => "dx",
        };
        Some(FixtureDescriptor {
            name: test.to_owned(),
            main_class: entry.main_class.clone(),
            snapshot,
            directory: base.join(toolchain_dir).join(test),
            native_library_dir: base.join("lib64"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use dd_types::{InputToolchain, RuntimeVersion};

    use super::{CorpusSnapshot, FixtureRegistry};

    const MANIFEST: &str = r#"
snapshots:
  current: tests/2017-10-04/art
  legacy: tests/2016-12-19/art
tests:
  001-HelloWorld: {}
  952-invoke-custom:
    snapshots: [current]
  004-JniTest:
    toolchains: [dx, jack]
    main_class: JniTestMain
"#;

    #[test]
    fn snapshot_selection_follows_toolchain_and_version() {
        assert_eq!(
            CorpusSnapshot::select(InputToolchain::LegacyDexer, RuntimeVersion::Default),
            CorpusSnapshot::Legacy
        );
        assert_eq!(
            CorpusSnapshot::select(InputToolchain::ExternalDexer, RuntimeVersion::V6_0_1),
            CorpusSnapshot::Legacy
        );
        assert_eq!(
            CorpusSnapshot::select(InputToolchain::ExternalDexer, RuntimeVersion::V8_1_0),
            CorpusSnapshot::Current
        );
    }

    #[test]
    fn lookup_builds_directory_from_snapshot_and_toolchain() {
        let registry = FixtureRegistry::from_yaml_str("/work", MANIFEST).expect("registry");
        let descriptor = registry
            .lookup("001-HelloWorld", InputToolchain::NoPreprocessing, RuntimeVersion::Default)
            .expect("present");
        assert_eq!(
            descriptor.directory,
            std::path::Path::new("/work/tests/2017-10-04/art/dx/001-HelloWorld")
        );
        assert_eq!(descriptor.main_class, "Main");

        let jni = registry
            .lookup("004-JniTest", InputToolchain::LegacyDexer, RuntimeVersion::V7_0_0)
            .expect("jack fixture");
        assert!(jni.directory.ends_with("2016-12-19/art/jack/004-JniTest"));
        assert!(jni.native_library_dir.ends_with("2016-12-19/art/lib64"));
    }

    #[test]
    fn lookup_misses_outside_registered_snapshot() {
        let registry = FixtureRegistry::from_yaml_str("/work", MANIFEST).expect("registry");
        assert!(
            registry
                .lookup("952-invoke-custom", InputToolchain::ExternalDexer, RuntimeVersion::V5_1_1)
                .is_none()
        );
        assert!(
            registry
                .lookup("004-JniTest", InputToolchain::NoPreprocessing, RuntimeVersion::Default)
                .is_none()
        );
        assert!(
            registry
                .lookup("999-unknown", InputToolchain::ExternalDexer, RuntimeVersion::Default)
                .is_none()
        );
    }

    #[test]
    fn manifest_without_both_snapshots_is_rejected() {
        let err = FixtureRegistry::from_yaml_str("/work", "snapshots: {current: a}\n")
            .expect_err("missing legacy");
        assert!(err.to_string().contains("Legacy"));
    }

    #[test]
    fn class_file_inputs_are_gathered_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manifest = MANIFEST.replace("tests/2017-10-04/art", "current");
        let registry = FixtureRegistry::from_yaml_str(temp.path(), &manifest).expect("registry");
        let descriptor = registry
            .lookup("001-HelloWorld", InputToolchain::NoPreprocessing, RuntimeVersion::Default)
            .expect("present");

        fs::create_dir_all(descriptor.resolve_file("classes/pkg")).expect("classes");
        fs::write(descriptor.resolve_file("classes/Main.class"), b"cafebabe").expect("main");
        fs::write(descriptor.resolve_file("classes/pkg/Util.class"), b"cafebabe").expect("util");
        fs::create_dir_all(descriptor.resolve_file("smali")).expect("smali");
        fs::write(descriptor.resolve_file("smali/out.dex"), b"dex\n035").expect("smali dex");
        fs::create_dir_all(descriptor.resolve_file("classes2")).expect("classes2");
        fs::write(descriptor.resolve_file("classes2/Second.class"), b"cafebabe").expect("second");

        let inputs = descriptor
            .collect_inputs(InputToolchain::NoPreprocessing)
            .expect("inputs");
        let names = inputs
            .iter()
            .map(|path| {
                path.strip_prefix(&descriptor.directory)
                    .expect("inside fixture")
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "classes/Main.class",
                "classes/pkg/Util.class",
                "smali/out.dex",
                "classes2/Second.class",
            ]
        );
    }

    #[test]
    fn dex_inputs_skip_jasmin_outputs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manifest = MANIFEST.replace("tests/2017-10-04/art", "current");
        let registry = FixtureRegistry::from_yaml_str(temp.path(), &manifest).expect("registry");
        let descriptor = registry
            .lookup("001-HelloWorld", InputToolchain::ExternalDexer, RuntimeVersion::Default)
            .expect("present");
        fs::create_dir_all(&descriptor.directory).expect("dir");
        for name in ["classes.dex", "classes2.dex", "jasmin.dex", "expected.txt"] {
            fs::write(descriptor.resolve_file(name), b"x").expect("write");
        }
        let inputs = descriptor
            .collect_inputs(InputToolchain::ExternalDexer)
            .expect("inputs");
        assert_eq!(inputs.len(), 2);
        assert!(inputs.iter().all(|path| {
            !path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("jasmin"))
        }));
    }
}
