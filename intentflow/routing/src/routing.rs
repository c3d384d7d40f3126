//! Routing definition: the resolved view an executor consults at dispatch time.

use std::{
    collections::BTreeMap,
    fmt,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    context_model::ContextModel,
    directory::{workflow_root, CommandDirectory, CommandSource, DirectoryConfig},
    error::{Result, RoutingError},
    names::{self, WILDCARD_COMMAND},
    registry::{Generation, Registry},
    telemetry::{self, Telemetry},
};

/// Routing sidecar file name inside `___command_info`.
pub const ROUTING_SIDECAR: &str = "routing_definition.json";

const SIDECAR_VERSION: u32 = 1;

/// Which implementation class of a command module to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    /// Parameter-extraction input (`Signature.Input`).
    ParameterInput,
    /// Parameter object (`Signature.Output`).
    Parameters,
    /// Response generation (`ResponseGenerator`).
    ResponseGeneration,
}

impl ModuleType {
    /// Dotted class path this module type resolves to.
    #[must_use]
    pub const fn class_path(self) -> &'static str {
        match self {
            Self::ParameterInput => "Signature.Input",
            Self::Parameters => "Signature.Output",
            Self::ResponseGeneration => "ResponseGenerator",
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::ParameterInput => "parameter_input",
            Self::Parameters => "parameters",
            Self::ResponseGeneration => "response_generation",
        }
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleType {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "parameter_input" | "input" => Ok(Self::ParameterInput),
            "parameters" | "output" => Ok(Self::Parameters),
            "response_generation" | "response" => Ok(Self::ResponseGeneration),
            other => Err(format!("unknown module type: {other}")),
        }
    }
}

/// A resolved implementation class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandClass {
    /// Qualified command name.
    pub command: String,
    /// Module the class lives in.
    pub module_name: String,
    /// Dotted class path inside the module.
    pub class_path: String,
    /// Requested module type.
    pub module_type: ModuleType,
    /// Absolute source file, absent for core commands.
    pub path: Option<PathBuf>,
    /// Declaration line in the source file.
    pub line: Option<usize>,
}

/// Options shared by build and load.
#[derive(Debug, Clone, Default)]
pub struct RoutingOptions {
    /// Scanning configuration.
    pub config: DirectoryConfig,
    /// Optional telemetry handle.
    pub telemetry: Option<Telemetry>,
    /// Token invalidating the class cache.
    pub generation: Generation,
}

#[derive(Debug, Serialize, Deserialize)]
struct RoutingSnapshot {
    version: u32,
    contexts: BTreeMap<String, Vec<String>>,
}

/// Directory, context model and resolved per-context command lists of one workflow.
pub struct RoutingDefinition {
    root: PathBuf,
    directory: Arc<CommandDirectory>,
    model: ContextModel,
    contexts: BTreeMap<String, Vec<String>>,
    classes: Registry<String, Option<CommandClass>>,
    telemetry: Option<Telemetry>,
}

impl fmt::Debug for RoutingDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingDefinition")
            .field("root", &self.root)
            .field("contexts", &self.contexts)
            .finish_non_exhaustive()
    }
}

impl RoutingDefinition {
    /// Builds with default options.
    pub fn build(root: impl AsRef<Path>) -> Result<Self> {
        Self::build_with(root, &RoutingOptions::default())
    }

    /// Scans, hydrates and resolves `root`, then persists both sidecars.
    pub fn build_with(root: impl AsRef<Path>, options: &RoutingOptions) -> Result<Self> {
        let tel = options.telemetry.as_ref();
        let mut directory = CommandDirectory::scan_with_telemetry(root, &options.config, tel)?;
        directory.hydrate_all(tel);
        directory.save()?;

        let root = directory.root().to_path_buf();
        let directory = Arc::new(directory);
        let model = ContextModel::load(&root, directory.clone())?;

        let mut contexts = BTreeMap::new();
        for context in model.contexts() {
            let resolved = with_core(model.commands(&context)?, &directory);
            contexts.insert(context, resolved);
        }

        let definition = Self::assemble(root, directory, model, contexts, options);
        definition.save()?;
        telemetry::log(
            tel,
            LogLevel::Info,
            "routing.definition_built",
            json!({
                "root": definition.root,
                "contexts": definition.contexts.len(),
                "skipped": definition.directory.load_failures().len(),
            }),
        );
        telemetry::event(
            tel,
            "routing.definition.built",
            json!({ "root": definition.root, "contexts": definition.contexts.keys().collect::<Vec<_>>() }),
        );
        Ok(definition)
    }

    /// Loads with default options.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        Self::load_with(root, &RoutingOptions::default())
    }

    /// Loads the routing sidecar, building when it is missing.
    ///
    /// A sidecar that exists but cannot be parsed is an error.
    pub fn load_with(root: impl AsRef<Path>, options: &RoutingOptions) -> Result<Self> {
        let root = workflow_root(root.as_ref())?;
        let tel = options.telemetry.as_ref();
        let sidecar = sidecar_path(&root);
        if !sidecar.is_file() {
            telemetry::log(
                tel,
                LogLevel::Debug,
                "routing.sidecar_missing",
                json!({ "path": sidecar }),
            );
            return Self::build_with(&root, options);
        }

        let raw = fs::read_to_string(&sidecar).map_err(|err| RoutingError::io(&sidecar, err))?;
        let snapshot: RoutingSnapshot =
            serde_json::from_str(&raw).map_err(|err| RoutingError::json(&sidecar, err))?;
        if snapshot.version != SIDECAR_VERSION {
            return Err(RoutingError::CommandLoad {
                command: ROUTING_SIDECAR.into(),
                reason: format!("unsupported sidecar version {}", snapshot.version),
            });
        }

        let directory = Arc::new(CommandDirectory::load_with_telemetry(
            &root,
            &options.config,
            tel,
        )?);
        let model = ContextModel::load(&root, directory.clone())?;
        let definition = Self::assemble(root, directory, model, snapshot.contexts, options);
        telemetry::event(
            tel,
            "routing.definition.loaded",
            json!({ "root": definition.root, "contexts": definition.contexts.len() }),
        );
        Ok(definition)
    }

    fn assemble(
        root: PathBuf,
        directory: Arc<CommandDirectory>,
        model: ContextModel,
        contexts: BTreeMap<String, Vec<String>>,
        options: &RoutingOptions,
    ) -> Self {
        Self {
            root,
            directory,
            model,
            contexts,
            classes: Registry::new(options.generation.clone()),
            telemetry: options.telemetry.clone(),
        }
    }

    /// Writes the resolved map to `___command_info/routing_definition.json`.
    pub fn save(&self) -> Result<PathBuf> {
        let info_dir = self.directory.info_dir();
        fs::create_dir_all(&info_dir).map_err(|err| RoutingError::io(&info_dir, err))?;
        let path = sidecar_path(&self.root);
        let snapshot = RoutingSnapshot {
            version: SIDECAR_VERSION,
            contexts: self.contexts.clone(),
        };
        let data =
            serde_json::to_vec_pretty(&snapshot).map_err(|err| RoutingError::json(&path, err))?;
        fs::write(&path, data).map_err(|err| RoutingError::io(&path, err))?;
        Ok(path)
    }

    /// Visible simple command names of `context`, sorted, without the wildcard.
    pub fn get_command_names(&self, context: &str) -> Result<Vec<String>> {
        let mut visible: Vec<String> = self
            .resolved(context)?
            .iter()
            .map(|qualified| names::simple_name(qualified))
            .filter(|name| *name != WILDCARD_COMMAND)
            .map(ToOwned::to_owned)
            .collect();
        visible.sort();
        visible.dedup();
        Ok(visible)
    }

    /// Qualified command names of `context`, wildcard included.
    pub fn get_qualified_command_names(&self, context: &str) -> Result<&[String]> {
        self.resolved(context).map(Vec::as_slice)
    }

    /// Alias of [`RoutingDefinition::get_qualified_command_names`].
    pub fn commands(&self, context: &str) -> Result<&[String]> {
        self.get_qualified_command_names(context)
    }

    /// Maps a simple or qualified label to the qualified command visible in `context`.
    pub fn resolve_command(&self, context: &str, label: &str) -> Result<String> {
        let resolved = self.resolved(context)?;
        if resolved.iter().any(|name| name == label) {
            return Ok(label.to_string());
        }
        let simple = names::simple_name(label);
        resolved
            .iter()
            .find(|name| names::simple_name(name) == simple)
            .cloned()
            .ok_or_else(|| RoutingError::UnknownCommand(label.to_string()))
    }

    /// Resolves the implementation class of `name` for `module_type`.
    ///
    /// Returns `None` when the command does not declare that class or cannot be
    /// hydrated. Results are cached under `"{name}:{module_type}"`.
    #[must_use]
    pub fn get_command_class(&self, name: &str, module_type: ModuleType) -> Option<CommandClass> {
        let key = format!("{name}:{module_type}");
        let outcome: std::result::Result<_, std::convert::Infallible> = self
            .classes
            .get_or_build(key, || Ok(self.lookup_class(name, module_type)));
        outcome.ok().flatten()
    }

    fn lookup_class(&self, name: &str, module_type: ModuleType) -> Option<CommandClass> {
        let module = match self.directory.ensure_hydrated(name) {
            Ok(module) => module,
            Err(err) => {
                telemetry::log(
                    self.telemetry.as_ref(),
                    LogLevel::Debug,
                    "routing.class_unresolved",
                    json!({ "command": name, "module_type": module_type, "error": err.to_string() }),
                );
                return None;
            }
        };
        let class = module.class(module_type.class_path())?;
        let metadata = self.directory.get_metadata(name).ok()?;
        let path = match metadata.source {
            CommandSource::File => metadata
                .path
                .as_ref()
                .map(|rel| self.directory.commands_dir().join(rel)),
            CommandSource::Core => None,
        };
        Some(CommandClass {
            command: name.to_string(),
            module_name: class.module,
            class_path: class.class_path,
            module_type,
            path,
            line: class.line,
        })
    }

    /// Structural ancestors of `context`, nearest first.
    pub fn get_ancestor_contexts(&self, context: &str) -> Result<Vec<String>> {
        self.model.get_ancestor_contexts(context)
    }

    /// Resolved `context -> qualified commands` map.
    #[must_use]
    pub const fn contexts(&self) -> &BTreeMap<String, Vec<String>> {
        &self.contexts
    }

    /// Underlying command directory.
    #[must_use]
    pub fn directory(&self) -> &CommandDirectory {
        &self.directory
    }

    /// Underlying context model.
    #[must_use]
    pub const fn context_model(&self) -> &ContextModel {
        &self.model
    }

    /// Absolute workflow root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolved(&self, context: &str) -> Result<&Vec<String>> {
        self.contexts
            .get(context)
            .ok_or_else(|| RoutingError::UnknownContext(context.to_string()))
    }
}

fn sidecar_path(root: &Path) -> PathBuf {
    root.join(crate::directory::INFO_DIR).join(ROUTING_SIDECAR)
}

/// Adds every core command whose simple name is not already taken.
fn with_core(mut resolved: Vec<String>, directory: &CommandDirectory) -> Vec<String> {
    for core in directory.core_commands().iter() {
        if !resolved.iter().any(|name| names::simple_name(name) == core) {
            resolved.push(core.to_string());
        }
    }
    resolved.sort();
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::fixtures::{write, GENERATOR, WITH_SIGNATURE};
    use crate::directory::{DIRECTORY_SIDECAR, INFO_DIR};
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn order_context_lists_cancel_and_core() {
        let tmp = tempdir().unwrap();
        write(tmp.path(), "_commands/Order/cancel.py", WITH_SIGNATURE);
        write(
            tmp.path(),
            "_commands/context_inheritance_model.json",
            r#"{"Order": {"base": []}}"#,
        );

        let definition = RoutingDefinition::build(tmp.path()).unwrap();
        assert_eq!(definition.get_command_names("Order").unwrap(), vec!["abort", "cancel"]);
        assert_eq!(
            definition.get_qualified_command_names("Order").unwrap(),
            ["Order/cancel", "abort", "wildcard"]
        );
        assert_eq!(
            definition.get_qualified_command_names("*").unwrap(),
            ["abort", "wildcard"]
        );

        let class = definition
            .get_command_class("Order/cancel", ModuleType::ResponseGeneration)
            .unwrap();
        assert_eq!(class.class_path, "ResponseGenerator");
        assert_eq!(class.module_name, "commands.Order.cancel");
        assert_eq!(class.line, Some(7));
        assert!(class.path.unwrap().ends_with("_commands/Order/cancel.py"));
    }

    #[test]
    fn missing_module_type_is_none() {
        let tmp = tempdir().unwrap();
        write(tmp.path(), "_commands/Order/track.py", GENERATOR);
        let definition = RoutingDefinition::build(tmp.path()).unwrap();
        assert!(definition
            .get_command_class("Order/track", ModuleType::ParameterInput)
            .is_none());
        assert!(definition
            .get_command_class("Order/ghost", ModuleType::ResponseGeneration)
            .is_none());
        let core = definition
            .get_command_class("abort", ModuleType::ResponseGeneration)
            .unwrap();
        assert_eq!(core.module_name, "core.abort");
        assert!(core.path.is_none());
    }

    #[test]
    fn nested_signature_classes_resolve() {
        let tmp = tempdir().unwrap();
        write(tmp.path(), "_commands/Order/cancel.py", WITH_SIGNATURE);
        let definition = RoutingDefinition::build(tmp.path()).unwrap();
        let input = definition
            .get_command_class("Order/cancel", ModuleType::ParameterInput)
            .unwrap();
        assert_eq!(input.class_path, "Signature.Input");
        let output = definition
            .get_command_class("Order/cancel", ModuleType::Parameters)
            .unwrap();
        assert_eq!(output.class_path, "Signature.Output");
    }

    #[test]
    fn unknown_context_is_reported() {
        let tmp = tempdir().unwrap();
        write(tmp.path(), "_commands/help.py", GENERATOR);
        let definition = RoutingDefinition::build(tmp.path()).unwrap();
        assert!(matches!(
            definition.get_command_names("Billing"),
            Err(RoutingError::UnknownContext(ref c)) if c == "Billing"
        ));
        assert_eq!(definition.get_command_names("*").unwrap(), vec!["abort", "help"]);
    }

    #[test]
    fn resolve_command_maps_simple_labels() {
        let tmp = tempdir().unwrap();
        write(tmp.path(), "_commands/Order/cancel.py", GENERATOR);
        let definition = RoutingDefinition::build(tmp.path()).unwrap();
        assert_eq!(definition.resolve_command("Order", "cancel").unwrap(), "Order/cancel");
        assert_eq!(definition.resolve_command("Order", "abort").unwrap(), "abort");
        assert!(definition.resolve_command("Order", "refund").is_err());
    }

    #[test]
    fn build_persists_and_load_round_trips() {
        let tmp = tempdir().unwrap();
        write(tmp.path(), "_commands/Order/cancel.py", GENERATOR);
        write(tmp.path(), "_commands/Vip/upgrade.py", GENERATOR);
        write(
            tmp.path(),
            "_commands/context_inheritance_model.json",
            r#"{"Vip": {"base": ["Order"]}}"#,
        );
        let bus = Arc::new(MemoryEventBus::new(8));
        let telemetry = Telemetry::builder("routing")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let options = RoutingOptions {
            telemetry: Some(telemetry),
            ..RoutingOptions::default()
        };

        let built = RoutingDefinition::build_with(tmp.path(), &options).unwrap();
        built.save().unwrap();
        assert!(tmp.path().join(INFO_DIR).join(DIRECTORY_SIDECAR).is_file());

        let loaded = RoutingDefinition::load_with(tmp.path(), &options).unwrap();
        assert_eq!(built.contexts(), loaded.contexts());
        assert_eq!(bus.of_type("routing.definition.built").len(), 1);
        assert_eq!(bus.of_type("routing.definition.loaded").len(), 1);
    }

    #[test]
    fn corrupt_sidecar_fails_loudly() {
        let tmp = tempdir().unwrap();
        write(tmp.path(), "_commands/Order/cancel.py", GENERATOR);
        RoutingDefinition::build(tmp.path()).unwrap();
        fs::write(tmp.path().join(INFO_DIR).join(ROUTING_SIDECAR), "[]").unwrap();
        assert!(matches!(
            RoutingDefinition::load(tmp.path()),
            Err(RoutingError::Json { .. })
        ));
    }

    #[test]
    fn missing_commands_folder_is_fatal() {
        let tmp = tempdir().unwrap();
        assert!(matches!(
            RoutingDefinition::build(tmp.path()),
            Err(RoutingError::MissingCommandsDir(_))
        ));
    }

    #[test]
    fn module_type_parses_cli_names() {
        assert_eq!("response".parse::<ModuleType>(), Ok(ModuleType::ResponseGeneration));
        assert_eq!(
            ModuleType::ParameterInput.to_string().parse::<ModuleType>(),
            Ok(ModuleType::ParameterInput)
        );
        assert!("nope".parse::<ModuleType>().is_err());
    }
}
