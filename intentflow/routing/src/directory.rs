//! Command directory: discovers command files under `_commands` and hydrates them lazily.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    context_model::ContextCommandSource,
    declarations::ModuleDeclarations,
    error::{Result, RoutingError},
    names::{self, CoreCommands, WILDCARD_CONTEXT},
    telemetry::{self, Telemetry},
};

/// Folder holding command definitions under a workflow root.
pub const COMMANDS_DIR: &str = "_commands";
/// Folder holding generated artifacts under a workflow root.
pub const INFO_DIR: &str = "___command_info";
/// Directory sidecar file name inside [`INFO_DIR`].
pub const DIRECTORY_SIDECAR: &str = "command_directory.json";
/// Class every command module must declare.
pub const RESPONSE_GENERATOR_CLASS: &str = "ResponseGenerator";
/// Optional parameter-extraction class.
pub const SIGNATURE_CLASS: &str = "Signature";
/// Class a context callback module declares.
pub const CONTEXT_CALLBACK_CLASS: &str = "Context";

const SIDECAR_VERSION: u32 = 1;

/// Scanning configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// File and folder names never scanned.
    pub excluded: BTreeSet<String>,
    /// Extension of command definition files, without the dot.
    pub extension: String,
    /// Reserved folder skipped by discovery.
    pub core_folder: String,
    /// Commands every context receives.
    pub core_commands: CoreCommands,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        let excluded = [
            ".git",
            ".hg",
            ".svn",
            "__pycache__",
            ".mypy_cache",
            ".pytest_cache",
            "node_modules",
            "target",
            "build",
            "dist",
            ".venv",
            "venv",
            INFO_DIR,
        ];
        Self {
            excluded: excluded.iter().map(|name| (*name).to_string()).collect(),
            extension: "py".into(),
            core_folder: "Core".into(),
            core_commands: CoreCommands::default(),
        }
    }
}

impl DirectoryConfig {
    /// True for names discovery never looks at.
    #[must_use]
    pub fn is_ignored(&self, name: &str) -> bool {
        name.starts_with('.') || name.starts_with('_') || self.excluded.contains(name)
    }

    fn command_stem<'a>(&self, file_name: &'a str) -> Option<&'a str> {
        let (stem, ext) = file_name.rsplit_once('.')?;
        (ext == self.extension && !stem.is_empty()).then_some(stem)
    }
}

/// Where a command comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    /// Discovered command file.
    File,
    /// Declared core command without a file.
    Core,
}

/// Reference to a class inside a command module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRef {
    /// Deterministic module name.
    pub module: String,
    /// Dotted class path inside the module.
    pub class_path: String,
    /// Declaration line, absent for built-in core modules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

/// Parameter-extraction definition exposed by a command module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// The `Signature` class.
    pub signature: ClassRef,
    /// `Signature.Input`, when declared.
    pub input: Option<ClassRef>,
    /// `Signature.Output` (the parameter object), when declared.
    pub output: Option<ClassRef>,
}

/// Hydrated view of a command module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandModule {
    /// Deterministic module name.
    pub module_name: String,
    /// Required response-generation class.
    pub response_generator: ClassRef,
    /// Optional parameter-extraction definition.
    pub parameter_spec: Option<ParameterSpec>,
    /// Every class path the module exposes.
    pub declarations: ModuleDeclarations,
}

impl CommandModule {
    fn core(name: &str) -> Self {
        let module_name = format!("core.{name}");
        Self {
            response_generator: ClassRef {
                module: module_name.clone(),
                class_path: RESPONSE_GENERATOR_CLASS.into(),
                line: None,
            },
            module_name,
            parameter_spec: None,
            declarations: ModuleDeclarations::default(),
        }
    }

    fn from_declarations(
        module_name: &str,
        declarations: ModuleDeclarations,
    ) -> std::result::Result<Self, String> {
        let class_ref = |path: &str| {
            declarations.find(path).map(|decl| ClassRef {
                module: module_name.to_string(),
                class_path: decl.qualname.clone(),
                line: Some(decl.line),
            })
        };
        let response_generator = class_ref(RESPONSE_GENERATOR_CLASS)
            .ok_or_else(|| format!("module declares no {RESPONSE_GENERATOR_CLASS} class"))?;
        let parameter_spec = class_ref(SIGNATURE_CLASS).map(|signature| ParameterSpec {
            signature,
            input: class_ref(&format!("{SIGNATURE_CLASS}.Input")),
            output: class_ref(&format!("{SIGNATURE_CLASS}.Output")),
        });
        Ok(Self {
            module_name: module_name.to_string(),
            response_generator,
            parameter_spec,
            declarations,
        })
    }

    /// Resolves a dotted class path, including the built-in core generator.
    #[must_use]
    pub fn class(&self, class_path: &str) -> Option<ClassRef> {
        if class_path == self.response_generator.class_path {
            return Some(self.response_generator.clone());
        }
        self.declarations.find(class_path).map(|decl| ClassRef {
            module: self.module_name.clone(),
            class_path: decl.qualname.clone(),
            line: Some(decl.line),
        })
    }
}

/// Static metadata for one discovered command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// `Context/name` or bare global name.
    pub qualified_name: String,
    /// Owning context; `None` for global and core commands.
    pub context: Option<String>,
    /// File or core.
    pub source: CommandSource,
    /// Command file, relative to `_commands`.
    pub path: Option<PathBuf>,
    /// Deterministic module name derived from the path.
    pub module_name: String,
}

impl CommandMetadata {
    /// Command part of the qualified name.
    #[must_use]
    pub fn simple_name(&self) -> &str {
        names::simple_name(&self.qualified_name)
    }
}

/// Metadata for one context folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMetadata {
    /// Context name (`*` for the global command set).
    pub name: String,
    /// Folder relative to `_commands`.
    pub path: PathBuf,
    /// `Context` class of the `_<Name>` callback module, if any.
    pub callback: Option<ClassRef>,
    /// Qualified command names, sorted.
    pub commands: Vec<String>,
}

/// A command that failed to hydrate and was excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLoadFailure {
    /// Qualified command name.
    pub command: String,
    /// Human readable cause.
    pub reason: String,
}

#[derive(Debug, Clone)]
struct CommandEntry {
    metadata: CommandMetadata,
    module: OnceCell<std::result::Result<CommandModule, String>>,
}

impl CommandEntry {
    fn new(metadata: CommandMetadata) -> Self {
        Self {
            metadata,
            module: OnceCell::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CommandRecord {
    #[serde(flatten)]
    metadata: CommandMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    module: Option<CommandModule>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DirectorySnapshot {
    version: u32,
    config: DirectoryConfig,
    commands: Vec<CommandRecord>,
    contexts: Vec<ContextMetadata>,
}

/// Lookup table from qualified command name to metadata.
#[derive(Debug, Clone)]
pub struct CommandDirectory {
    root: PathBuf,
    config: DirectoryConfig,
    commands: BTreeMap<String, CommandEntry>,
    contexts: BTreeMap<String, ContextMetadata>,
    failures: Vec<CommandLoadFailure>,
}

impl CommandDirectory {
    /// Loads from the sidecar when present, otherwise scans `root`.
    pub fn load(root: impl AsRef<Path>, config: &DirectoryConfig) -> Result<Self> {
        Self::load_with_telemetry(root, config, None)
    }

    /// [`CommandDirectory::load`] with optional telemetry.
    pub fn load_with_telemetry(
        root: impl AsRef<Path>,
        config: &DirectoryConfig,
        telemetry: Option<&Telemetry>,
    ) -> Result<Self> {
        let root = workflow_root(root.as_ref())?;
        let sidecar = root.join(INFO_DIR).join(DIRECTORY_SIDECAR);
        if sidecar.is_file() {
            let directory = Self::from_sidecar(root, &sidecar, config, telemetry)?;
            telemetry::log(
                telemetry,
                LogLevel::Debug,
                "directory.sidecar_loaded",
                json!({ "path": sidecar, "commands": directory.commands.len() }),
            );
            return Ok(directory);
        }
        Self::scan_root(root, config, telemetry)
    }

    /// Scans `root`, ignoring any sidecar.
    pub fn scan(root: impl AsRef<Path>, config: &DirectoryConfig) -> Result<Self> {
        Self::scan_with_telemetry(root, config, None)
    }

    /// [`CommandDirectory::scan`] with optional telemetry.
    pub fn scan_with_telemetry(
        root: impl AsRef<Path>,
        config: &DirectoryConfig,
        telemetry: Option<&Telemetry>,
    ) -> Result<Self> {
        let root = workflow_root(root.as_ref())?;
        Self::scan_root(root, config, telemetry)
    }

    fn scan_root(
        root: PathBuf,
        config: &DirectoryConfig,
        telemetry: Option<&Telemetry>,
    ) -> Result<Self> {
        let commands_dir = root.join(COMMANDS_DIR);
        let mut directory = Self {
            root,
            config: config.clone(),
            commands: BTreeMap::new(),
            contexts: BTreeMap::new(),
            failures: Vec::new(),
        };
        let mut globals = Vec::new();

        for (name, path, is_dir) in sorted_entries(&commands_dir, telemetry)? {
            if config.is_ignored(&name) {
                continue;
            }
            if is_dir {
                if name == config.core_folder {
                    continue;
                }
                directory.scan_context(&name, &path, telemetry)?;
            } else if let Some(stem) = config.command_stem(&name) {
                let rel = PathBuf::from(&name);
                directory.insert_file_command(names::qualify(WILDCARD_CONTEXT, stem), None, rel);
                globals.push(stem.to_string());
            }
        }

        if !globals.is_empty() {
            globals.sort();
            directory.contexts.insert(
                WILDCARD_CONTEXT.to_string(),
                ContextMetadata {
                    name: WILDCARD_CONTEXT.to_string(),
                    path: PathBuf::new(),
                    callback: None,
                    commands: globals,
                },
            );
        }

        for core in config.core_commands.iter() {
            directory
                .commands
                .entry(core.to_string())
                .or_insert_with(|| {
                    CommandEntry::new(CommandMetadata {
                        qualified_name: core.to_string(),
                        context: None,
                        source: CommandSource::Core,
                        path: None,
                        module_name: format!("core.{core}"),
                    })
                });
        }

        telemetry::log(
            telemetry,
            LogLevel::Info,
            "directory.scanned",
            json!({
                "root": directory.root,
                "commands": directory.commands.len(),
                "contexts": directory.contexts.len(),
            }),
        );
        Ok(directory)
    }

    fn scan_context(
        &mut self,
        context: &str,
        folder: &Path,
        telemetry: Option<&Telemetry>,
    ) -> Result<()> {
        let callback_file = format!("_{context}.{}", self.config.extension);
        let mut commands = Vec::new();
        let mut callback = None;

        for (name, path, is_dir) in sorted_entries(folder, telemetry)? {
            if is_dir {
                continue;
            }
            if name == callback_file {
                callback = self.read_callback(context, &path, telemetry);
                continue;
            }
            if self.config.is_ignored(&name) {
                continue;
            }
            if let Some(stem) = self.config.command_stem(&name) {
                let qualified = names::qualify(context, stem);
                let rel = PathBuf::from(context).join(&name);
                self.insert_file_command(qualified.clone(), Some(context.to_string()), rel);
                commands.push(qualified);
            }
        }

        if commands.is_empty() {
            return Err(RoutingError::EmptyContextFolder {
                context: context.to_string(),
                path: folder.to_path_buf(),
            });
        }
        commands.sort();
        self.contexts.insert(
            context.to_string(),
            ContextMetadata {
                name: context.to_string(),
                path: PathBuf::from(context),
                callback,
                commands,
            },
        );
        Ok(())
    }

    fn read_callback(
        &self,
        context: &str,
        path: &Path,
        telemetry: Option<&Telemetry>,
    ) -> Option<ClassRef> {
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                telemetry::log(
                    telemetry,
                    LogLevel::Warn,
                    "directory.callback_unreadable",
                    json!({ "context": context, "path": path, "error": err.to_string() }),
                );
                return None;
            }
        };
        let declarations = ModuleDeclarations::parse(&source);
        declarations.find(CONTEXT_CALLBACK_CLASS).map(|decl| ClassRef {
            module: format!("commands.{context}._{context}"),
            class_path: decl.qualname.clone(),
            line: Some(decl.line),
        })
    }

    fn insert_file_command(&mut self, qualified: String, context: Option<String>, rel: PathBuf) {
        let module_name = module_name_for(&rel);
        self.commands.insert(
            qualified.clone(),
            CommandEntry::new(CommandMetadata {
                qualified_name: qualified,
                context,
                source: CommandSource::File,
                path: Some(rel),
                module_name,
            }),
        );
    }

    fn from_sidecar(
        root: PathBuf,
        sidecar: &Path,
        config: &DirectoryConfig,
        telemetry: Option<&Telemetry>,
    ) -> Result<Self> {
        let raw = fs::read_to_string(sidecar).map_err(|err| RoutingError::io(sidecar, err))?;
        let snapshot: DirectorySnapshot =
            serde_json::from_str(&raw).map_err(|err| RoutingError::json(sidecar, err))?;
        if snapshot.version != SIDECAR_VERSION {
            return Err(RoutingError::CommandLoad {
                command: DIRECTORY_SIDECAR.into(),
                reason: format!("unsupported sidecar version {}", snapshot.version),
            });
        }
        if snapshot.config != *config {
            telemetry::log(
                telemetry,
                LogLevel::Warn,
                "directory.sidecar_config_mismatch",
                json!({
                    "path": sidecar,
                    "sidecar": snapshot.config,
                    "requested": config,
                }),
            );
        }
        let commands = snapshot
            .commands
            .into_iter()
            .map(|record| {
                let entry = CommandEntry::new(record.metadata);
                if let Some(module) = record.module {
                    let _ = entry.module.set(Ok(module));
                }
                (entry.metadata.qualified_name.clone(), entry)
            })
            .collect();
        let contexts = snapshot
            .contexts
            .into_iter()
            .map(|context| (context.name.clone(), context))
            .collect();
        Ok(Self {
            root,
            config: snapshot.config,
            commands,
            contexts,
            failures: Vec::new(),
        })
    }

    /// Writes the sidecar, returning its path.
    pub fn save(&self) -> Result<PathBuf> {
        let info_dir = self.info_dir();
        fs::create_dir_all(&info_dir).map_err(|err| RoutingError::io(&info_dir, err))?;
        let snapshot = DirectorySnapshot {
            version: SIDECAR_VERSION,
            config: self.config.clone(),
            commands: self
                .commands
                .values()
                .map(|entry| CommandRecord {
                    metadata: entry.metadata.clone(),
                    module: entry.module.get().and_then(|m| m.as_ref().ok()).cloned(),
                })
                .collect(),
            contexts: self.contexts.values().cloned().collect(),
        };
        let path = info_dir.join(DIRECTORY_SIDECAR);
        let data =
            serde_json::to_vec_pretty(&snapshot).map_err(|err| RoutingError::json(&path, err))?;
        fs::write(&path, data).map_err(|err| RoutingError::io(&path, err))?;
        Ok(path)
    }

    /// Hydrates a command on first access; later calls return the memoised result.
    pub fn ensure_hydrated(&self, qualified_name: &str) -> Result<&CommandModule> {
        let entry = self
            .commands
            .get(qualified_name)
            .ok_or_else(|| RoutingError::UnknownCommand(qualified_name.to_string()))?;
        let outcome = entry.module.get_or_init(|| self.hydrate(&entry.metadata));
        outcome.as_ref().map_err(|reason| RoutingError::CommandLoad {
            command: qualified_name.to_string(),
            reason: reason.clone(),
        })
    }

    fn hydrate(&self, metadata: &CommandMetadata) -> std::result::Result<CommandModule, String> {
        let Some(rel) = &metadata.path else {
            return Ok(CommandModule::core(&metadata.qualified_name));
        };
        let path = self.commands_dir().join(rel);
        let source = fs::read_to_string(&path).map_err(|err| format!("reading {}: {err}", path.display()))?;
        CommandModule::from_declarations(&metadata.module_name, ModuleDeclarations::parse(&source))
    }

    /// Hydrates every command, excluding the ones that fail.
    ///
    /// Failures are logged at warn level, recorded in [`CommandDirectory::load_failures`]
    /// and removed from their context's command list. A context left without any
    /// command is dropped.
    pub fn hydrate_all(&mut self, telemetry: Option<&Telemetry>) -> Vec<CommandLoadFailure> {
        let mut failed = Vec::new();
        for (name, entry) in &self.commands {
            let outcome = entry.module.get_or_init(|| self.hydrate(&entry.metadata));
            if let Err(reason) = outcome {
                telemetry::log(
                    telemetry,
                    LogLevel::Warn,
                    "directory.command_skipped",
                    json!({ "command": name, "reason": reason }),
                );
                failed.push(CommandLoadFailure {
                    command: name.clone(),
                    reason: reason.clone(),
                });
            }
        }
        for failure in &failed {
            self.commands.remove(&failure.command);
            for context in self.contexts.values_mut() {
                context.commands.retain(|name| name != &failure.command);
            }
        }
        if !failed.is_empty() {
            self.contexts.retain(|name, context| {
                if !context.commands.is_empty() {
                    return true;
                }
                telemetry::log(
                    telemetry,
                    LogLevel::Warn,
                    "directory.context_dropped",
                    json!({ "context": name, "reason": "every command failed to load" }),
                );
                false
            });
        }
        self.failures.extend(failed.iter().cloned());
        failed
    }

    /// Metadata for a discovered command.
    pub fn get_metadata(&self, qualified_name: &str) -> Result<&CommandMetadata> {
        self.commands
            .get(qualified_name)
            .map(|entry| &entry.metadata)
            .ok_or_else(|| RoutingError::UnknownCommand(qualified_name.to_string()))
    }

    /// True when the command was discovered (or is core).
    #[must_use]
    pub fn contains(&self, qualified_name: &str) -> bool {
        self.commands.contains_key(qualified_name)
    }

    /// Every qualified command name, sorted.
    pub fn command_names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Discovered contexts, sorted by name.
    pub fn contexts(&self) -> impl Iterator<Item = &ContextMetadata> {
        self.contexts.values()
    }

    /// Metadata of one context folder.
    #[must_use]
    pub fn context(&self, name: &str) -> Option<&ContextMetadata> {
        self.contexts.get(name)
    }

    /// Commands excluded by [`CommandDirectory::hydrate_all`].
    #[must_use]
    pub fn load_failures(&self) -> &[CommandLoadFailure] {
        &self.failures
    }

    /// Scanning configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Declared core commands.
    #[must_use]
    pub const fn core_commands(&self) -> &CoreCommands {
        &self.config.core_commands
    }

    /// Absolute workflow root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/_commands`.
    #[must_use]
    pub fn commands_dir(&self) -> PathBuf {
        self.root.join(COMMANDS_DIR)
    }

    /// `<root>/___command_info`.
    #[must_use]
    pub fn info_dir(&self) -> PathBuf {
        self.root.join(INFO_DIR)
    }
}

impl ContextCommandSource for CommandDirectory {
    fn context_names(&self) -> Vec<String> {
        self.contexts.keys().cloned().collect()
    }

    fn context_commands(&self, context: &str) -> Option<Vec<String>> {
        self.contexts.get(context).map(|meta| meta.commands.clone())
    }
}

/// Resolves `root` to an absolute path, requiring a `_commands` folder.
pub(crate) fn workflow_root(root: &Path) -> Result<PathBuf> {
    if !root.join(COMMANDS_DIR).is_dir() {
        return Err(RoutingError::MissingCommandsDir(root.to_path_buf()));
    }
    fs::canonicalize(root).map_err(|err| RoutingError::io(root, err))
}

fn module_name_for(rel: &Path) -> String {
    let stemmed = rel.with_extension("");
    let parts: Vec<String> = stemmed
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect();
    format!("commands.{}", parts.join("."))
}

fn sorted_entries(
    folder: &Path,
    telemetry: Option<&Telemetry>,
) -> Result<Vec<(String, PathBuf, bool)>> {
    let reader = fs::read_dir(folder).map_err(|err| RoutingError::io(folder, err))?;
    let mut entries = Vec::new();
    for entry in reader {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                telemetry::log(
                    telemetry,
                    LogLevel::Warn,
                    "directory.entry_unreadable",
                    json!({ "folder": folder, "error": err.to_string() }),
                );
                continue;
            }
        };
        let path = entry.path();
        let Some(name) = entry.file_name().to_str().map(ToOwned::to_owned) else {
            telemetry::log(
                telemetry,
                LogLevel::Warn,
                "directory.non_utf8_name",
                json!({ "path": path }),
            );
            continue;
        };
        entries.push((name, path.clone(), path.is_dir()));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}
