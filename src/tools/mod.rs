//! Fixed registry of chemistry tools the agent can call without writing code.
//!
//! Arguments are validated here against typed structs; the work itself runs in the
//! sandbox worker, where the same functions are also part of every snippet's baseline.
//! Failures are returned, never swallowed: turning them into observations is the agent
//! loop's job.

use std::{fs, io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::is_identifier,
    llm::{FunctionSchema, ToolSchema},
    sandbox::{with_stale_note, Sandbox, SandboxError, TurnContext},
};

/// Python source loaded into the worker; its `__all__` is the tool set.
pub const TOOL_SOURCE: &str = include_str!("chemistry.py");

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments for `{tool}`: {reason}")]
    InvalidArguments { tool: &'static str, reason: String },
    #[error("`{tool}` refers to `{name}`, which is not defined in the current scope")]
    UnresolvedReference { tool: &'static str, name: String },
    #[error("cannot create output directory {}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("`{tool}` failed:\n{trace}")]
    Failed { tool: &'static str, trace: String },
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// A successful tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub bound_to: String,
    /// Observation text for the conversation.
    pub summary: String,
    pub context: TurnContext,
}

/// What the agent loop needs from a tool set.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    fn schemas(&self) -> Vec<ToolSchema>;

    async fn call(&self, name: &str, args_json: &str, context: &TurnContext) -> Result<ToolOutcome, ToolError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    ReadStructure,
    EnumerateSites,
    BuildFragment,
    PlaceFragment,
    Relax,
    RunDynamics,
    SaveStructure,
}

impl ToolKind {
    pub const ALL: [ToolKind; 7] = [
        ToolKind::ReadStructure,
        ToolKind::EnumerateSites,
        ToolKind::BuildFragment,
        ToolKind::PlaceFragment,
        ToolKind::Relax,
        ToolKind::RunDynamics,
        ToolKind::SaveStructure,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::ReadStructure => "read_structure",
            ToolKind::EnumerateSites => "enumerate_sites",
            ToolKind::BuildFragment => "build_fragment",
            ToolKind::PlaceFragment => "place_fragment",
            ToolKind::Relax => "relax",
            ToolKind::RunDynamics => "run_dynamics",
            ToolKind::SaveStructure => "save_structure",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Python-style signature, used in the system prompt.
    pub fn signature(self) -> &'static str {
        match self {
            ToolKind::ReadStructure => "read_structure(path) -> ase.Atoms",
            ToolKind::EnumerateSites => "enumerate_sites(structure) -> pandas.DataFrame",
            ToolKind::BuildFragment => {
                "build_fragment(descriptor, variant_count=1, variant_index=0) -> ase.Atoms"
            }
            ToolKind::PlaceFragment => {
                "place_fragment(slab, fragment, site, rotation_degrees=0.0, height=1.5) -> ase.Atoms"
            }
            ToolKind::Relax => "relax(structure, output_dir='./') -> ase.Atoms",
            ToolKind::RunDynamics => {
                "run_dynamics(structure, steps=100, temperature=300.0, output_dir='./') -> list[ase.Atoms]"
            }
            ToolKind::SaveStructure => "save_structure(structure, path) -> str",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolKind::ReadStructure => "Read an atomic structure file (xyz, cif, traj, ...).",
            ToolKind::EnumerateSites => {
                "Enumerate surface adsorption sites of a slab. One row per site with columns \
                 coordinates, connectivity (1 top, 2 bridge, 3 hollow), topology (surface atom \
                 indices), normal_vector, tangent_vector and composition."
            }
            ToolKind::BuildFragment => {
                "Build a ligand fragment from a marker-first SMILES; the marker atom sits at the \
                 origin. Increase variant_count for flexible ligands."
            }
            ToolKind::PlaceFragment => {
                "Place a fragment on a slab at a site, rotated about the site normal by \
                 rotation_degrees and lifted by height angstrom."
            }
            ToolKind::Relax => {
                "Relax a structure with the MACE calculator (lower half of the cell fixed). \
                 Blocks until converged; writes relax.traj."
            }
            ToolKind::RunDynamics => {
                "Run Langevin molecular dynamics; writes md.traj and md_traj.xyz and returns the frames."
            }
            ToolKind::SaveStructure => "Write a structure or list of frames to a file.",
        }
    }

    pub fn parameters(self) -> Value {
        let structure = |what: &str| json!({"type": "string", "description": format!("Name of the variable holding the {what}.")});
        let bind_to = json!({
            "type": "string",
            "description": format!("Variable to store the result in (default `{}_result`).", self.name())
        });
        let output_dir = json!({"type": "string", "description": "Directory for trajectory files (default: configured output directory)."});
        let (properties, required) = match self {
            ToolKind::ReadStructure => (
                json!({"path": {"type": "string", "description": "Path of the structure file."}}),
                vec!["path"],
            ),
            ToolKind::EnumerateSites => (json!({"structure": structure("slab")}), vec!["structure"]),
            ToolKind::BuildFragment => (
                json!({
                    "descriptor": {"type": "string", "description": "Marker-first (surrogate) SMILES."},
                    "variant_count": {"type": "integer", "minimum": 1, "default": 1},
                    "variant_index": {"type": "integer", "minimum": 0, "default": 0}
                }),
                vec!["descriptor"],
            ),
            ToolKind::PlaceFragment => (
                json!({
                    "slab": structure("slab"),
                    "fragment": structure("fragment"),
                    "site": {
                        "description": "Variable holding the chosen site, or the site as an object.",
                        "anyOf": [{"type": "string"}, {"type": "object"}]
                    },
                    "rotation_degrees": {"type": "number", "default": 0.0},
                    "height": {"type": "number", "default": 1.5}
                }),
                vec!["slab", "fragment", "site"],
            ),
            ToolKind::Relax => (
                json!({"structure": structure("structure"), "output_dir": output_dir}),
                vec!["structure"],
            ),
            ToolKind::RunDynamics => (
                json!({
                    "structure": structure("structure"),
                    "steps": {"type": "integer", "minimum": 1, "default": 100},
                    "temperature": {"type": "number", "description": "Kelvin.", "default": 300.0},
                    "output_dir": output_dir
                }),
                vec!["structure"],
            ),
            ToolKind::SaveStructure => (
                json!({"structure": structure("structure or frames"), "path": {"type": "string"}}),
                vec!["structure", "path"],
            ),
        };
        let mut properties = properties;
        properties["bind_to"] = bind_to;
        json!({"type": "object", "properties": properties, "required": required})
    }

    pub fn schema(self) -> ToolSchema {
        ToolSchema {
            r#type: "function".into(),
            function: FunctionSchema {
                name: self.name().into(),
                description: Some(self.description().into()),
                parameters: self.parameters(),
            },
        }
    }

    /// Validates `args` and lowers them to the worker's keyword arguments.
    pub fn invocation(self, args: Value, default_output_dir: &std::path::Path) -> Result<Invocation, ToolError> {
        let tool = self.name();
        let mut inv = Invocation::new(self);
        match self {
            ToolKind::ReadStructure => {
                let a: ReadStructureArgs = parse_args(tool, args)?;
                inv.literal("path", a.path);
                inv.bind_to(a.bind_to)?;
            }
            ToolKind::EnumerateSites => {
                let a: EnumerateSitesArgs = parse_args(tool, args)?;
                inv.variable("structure", a.structure)?;
                inv.bind_to(a.bind_to)?;
            }
            ToolKind::BuildFragment => {
                let a: BuildFragmentArgs = parse_args(tool, args)?;
                if a.variant_count == 0 {
                    return Err(invalid(tool, "variant_count must be at least 1"));
                }
                if a.variant_index >= a.variant_count {
                    return Err(invalid(
                        tool,
                        format!(
                            "variant_index {} is out of range for variant_count {}",
                            a.variant_index, a.variant_count
                        ),
                    ));
                }
                inv.literal("descriptor", a.descriptor);
                inv.literal("variant_count", a.variant_count);
                inv.literal("variant_index", a.variant_index);
                inv.bind_to(a.bind_to)?;
            }
            ToolKind::PlaceFragment => {
                let a: PlaceFragmentArgs = parse_args(tool, args)?;
                if !a.height.is_finite() || a.height <= 0.0 {
                    return Err(invalid(tool, "height must be a positive number of angstrom"));
                }
                if !a.rotation_degrees.is_finite() {
                    return Err(invalid(tool, "rotation_degrees must be finite"));
                }
                inv.variable("slab", a.slab)?;
                inv.variable("fragment", a.fragment)?;
                match a.site {
                    SiteArg::Variable(name) => inv.variable("site", name)?,
                    SiteArg::Inline(site) => inv.literal("site", Value::Object(site)),
                }
                inv.literal("rotation_degrees", a.rotation_degrees);
                inv.literal("height", a.height);
                inv.bind_to(a.bind_to)?;
            }
            ToolKind::Relax => {
                let a: RelaxArgs = parse_args(tool, args)?;
                inv.variable("structure", a.structure)?;
                inv.output_dir(a.output_dir, default_output_dir);
                inv.bind_to(a.bind_to)?;
            }
            ToolKind::RunDynamics => {
                let a: RunDynamicsArgs = parse_args(tool, args)?;
                if a.steps == 0 {
                    return Err(invalid(tool, "steps must be at least 1"));
                }
                if !a.temperature.is_finite() || a.temperature < 0.0 {
                    return Err(invalid(tool, "temperature must be a non-negative number of kelvin"));
                }
                inv.variable("structure", a.structure)?;
                inv.literal("steps", a.steps);
                inv.literal("temperature", a.temperature);
                inv.output_dir(a.output_dir, default_output_dir);
                inv.bind_to(a.bind_to)?;
            }
            ToolKind::SaveStructure => {
                let a: SaveStructureArgs = parse_args(tool, args)?;
                inv.variable("structure", a.structure)?;
                inv.literal("path", a.path);
                inv.bind_to(a.bind_to)?;
            }
        }
        Ok(inv)
    }
}

/// A validated call, ready for the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub kind: ToolKind,
    /// Keyword arguments; `{"$var": name}` marks a scope lookup.
    pub args: Map<String, Value>,
    pub references: Vec<String>,
    pub bind: String,
    pub output_dir: Option<PathBuf>,
}

impl Invocation {
    fn new(kind: ToolKind) -> Self {
        Self {
            kind,
            args: Map::new(),
            references: Vec::new(),
            bind: format!("{}_result", kind.name()),
            output_dir: None,
        }
    }

    fn literal(&mut self, key: &str, value: impl Into<Value>) {
        self.args.insert(key.into(), value.into());
    }

    fn variable(&mut self, key: &str, name: String) -> Result<(), ToolError> {
        if !is_identifier(&name) {
            return Err(invalid(
                self.kind.name(),
                format!("`{key}` must name a variable, got `{name}`"),
            ));
        }
        self.args.insert(key.into(), json!({ "$var": name }));
        self.references.push(name);
        Ok(())
    }

    fn output_dir(&mut self, requested: Option<String>, default: &std::path::Path) {
        let dir = requested
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default.to_path_buf());
        self.literal("output_dir", dir.to_string_lossy().into_owned());
        self.output_dir = Some(dir);
    }

    fn bind_to(&mut self, name: Option<String>) -> Result<(), ToolError> {
        if let Some(name) = name {
            if !is_identifier(&name) {
                return Err(invalid(
                    self.kind.name(),
                    format!("bind_to `{name}` is not a valid variable name"),
                ));
            }
            self.bind = name;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadStructureArgs {
    path: String,
    #[serde(default)]
    bind_to: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnumerateSitesArgs {
    structure: String,
    #[serde(default)]
    bind_to: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildFragmentArgs {
    descriptor: String,
    #[serde(default = "one")]
    variant_count: u32,
    #[serde(default)]
    variant_index: u32,
    #[serde(default)]
    bind_to: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SiteArg {
    Variable(String),
    Inline(Map<String, Value>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlaceFragmentArgs {
    slab: String,
    fragment: String,
    site: SiteArg,
    #[serde(default)]
    rotation_degrees: f64,
    #[serde(default = "default_height")]
    height: f64,
    #[serde(default)]
    bind_to: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RelaxArgs {
    structure: String,
    #[serde(default)]
    output_dir: Option<String>,
    #[serde(default)]
    bind_to: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunDynamicsArgs {
    structure: String,
    #[serde(default = "default_steps")]
    steps: u32,
    #[serde(default = "default_temperature")]
    temperature: f64,
    #[serde(default)]
    output_dir: Option<String>,
    #[serde(default)]
    bind_to: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SaveStructureArgs {
    structure: String,
    path: String,
    #[serde(default)]
    bind_to: Option<String>,
}

fn one() -> u32 {
    1
}

fn default_height() -> f64 {
    1.5
}

fn default_steps() -> u32 {
    100
}

fn default_temperature() -> f64 {
    300.0
}

fn invalid(tool: &'static str, reason: impl Into<String>) -> ToolError {
    ToolError::InvalidArguments {
        tool,
        reason: reason.into(),
    }
}

fn parse_args<T: DeserializeOwned>(tool: &'static str, args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| invalid(tool, e.to_string()))
}

pub struct ToolRegistry {
    sandbox: Arc<Sandbox>,
    output_dir: PathBuf,
}

impl ToolRegistry {
    pub fn new(sandbox: Arc<Sandbox>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            sandbox,
            output_dir: output_dir.into(),
        }
    }

    pub fn signatures() -> Vec<&'static str> {
        ToolKind::ALL.iter().map(|k| k.signature()).collect()
    }

    pub async fn execute(&self, name: &str, args_json: &str, context: &TurnContext) -> Result<ToolOutcome, ToolError> {
        let kind = ToolKind::from_name(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let args: Value = if args_json.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(args_json).map_err(|e| invalid(kind.name(), format!("not valid JSON: {e}")))?
        };
        let inv = kind.invocation(args, &self.output_dir)?;

        let scope = self.sandbox.prepare_scope(context);
        if let Some(name) = inv.references.iter().find(|r| scope.resolve(r).is_none()) {
            return Err(ToolError::UnresolvedReference {
                tool: kind.name(),
                name: name.clone(),
            });
        }
        if let Some(dir) = &inv.output_dir {
            fs::create_dir_all(dir).map_err(|source| ToolError::OutputDir {
                path: dir.clone(),
                source,
            })?;
        }

        info!(tool = kind.name(), bind = %inv.bind, "running tool");
        let args = Value::Object(inv.args);
        match self.sandbox.call_tool(kind.name(), &args, &inv.bind, context).await? {
            Ok(reply) => {
                debug!(tool = kind.name(), "tool finished");
                let mut summary = format!("{} = {}", inv.bind, reply.repr);
                if !reply.printed.trim().is_empty() {
                    summary.push_str("\n\nPrinted output:\n");
                    summary.push_str(reply.printed.trim_end());
                }
                if !reply.stale.is_empty() {
                    summary.push_str(&format!(
                        "\n[sandbox] dropped bindings held by a previous worker: {}",
                        reply.stale.join(", ")
                    ));
                }
                Ok(ToolOutcome {
                    bound_to: inv.bind,
                    summary,
                    context: reply.context,
                })
            }
            Err(failure) => Err(ToolError::Failed {
                tool: kind.name(),
                trace: with_stale_note(failure.error, &failure.stale),
            }),
        }
    }
}

#[async_trait]
impl ToolDispatch for ToolRegistry {
    fn schemas(&self) -> Vec<ToolSchema> {
        ToolKind::ALL.iter().map(|k| k.schema()).collect()
    }

    async fn call(&self, name: &str, args_json: &str, context: &TurnContext) -> Result<ToolOutcome, ToolError> {
        self.execute(name, args_json, context).await
    }
}
