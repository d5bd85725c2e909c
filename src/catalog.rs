//! The deployment catalog a process server serves from.
//!
//! The catalog knows three kinds of things: projects (opaque description
//! text, handed out verbatim), deployments (launchable binaries plus the
//! task names they register), and typekits (type registry data). Clients
//! receive the whole catalog as part of the connection handshake and refer
//! back to it by name.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use slog_scope::{debug, info};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

use crate::configuration::Config;
use crate::name_service::NotFound;
use crate::protocol::{InfoBundle, TypekitRegistry};

/// Identity of one deployment: its name, the project defining it, and the
/// task names it registers once it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentModel {
    pub name: String,
    pub project: String,
    #[serde(default)]
    pub task_names: Vec<String>,
}

/// A launchable deployment, as the server knows it. The binary and its
/// arguments never travel over the wire; clients only see the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    pub model: DeploymentModel,
    pub binary: PathBuf,
    pub args: Vec<String>,
}

/// The parseable subset of a project description.
///
/// Descriptions travel as opaque text. This is the JSON shape the bundled
/// catalog synthesizes when a project has no description file, and the one
/// shape clients know how to read deployment models back out of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDescription {
    pub name: String,
    #[serde(default)]
    pub deployments: Vec<DeploymentModel>,
}

impl ProjectDescription {
    pub fn parse(text: &str) -> Result<ProjectDescription> {
        serde_json::from_str(text).context("parsing project description")
    }

    pub fn render(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("rendering project description")
    }

    pub fn deployment(&self, name: &str) -> Option<&DeploymentModel> {
        self.deployments.iter().find(|d| d.name == name)
    }
}

#[derive(Debug)]
pub struct Catalog {
    projects: HashMap<String, String>,
    deployments: HashMap<String, Deployment>,
    typekits: HashMap<String, TypekitRegistry>,
    loaded_projects: HashSet<String>,
    loaded_typekits: HashSet<String>,
}

impl Catalog {
    /// Builds the catalog from the configuration, reading description and
    /// typekit files relative to the configuration file.
    pub fn from_config(settings: &Config) -> Result<Catalog> {
        let mut deployments = HashMap::new();
        for d in &settings.catalog.deployments {
            let deployment = Deployment {
                model: DeploymentModel {
                    name: d.name.clone(),
                    project: d.project.clone(),
                    task_names: d.tasks.clone(),
                },
                binary: settings.canonical_path(&d.binary),
                args: d.args.clone(),
            };
            if deployments.insert(d.name.clone(), deployment).is_some() {
                bail!("deployment {:?} is defined twice", d.name);
            }
        }

        let mut projects = HashMap::new();
        for p in &settings.catalog.projects {
            let description = match (&p.description, &p.description_file) {
                (Some(text), _) => text.clone(),
                (None, Some(file)) => {
                    let path = settings.canonical_path(file);
                    fs::read_to_string(&path).with_context(|| {
                        format!("reading description of project {:?} from {:?}", p.name, path)
                    })?
                }
                (None, None) => synthesized_description(&p.name, &deployments)?,
            };
            if projects.insert(p.name.clone(), description).is_some() {
                bail!("project {:?} is defined twice", p.name);
            }
        }
        // Deployments may name projects that have no entry of their own;
        // those get synthesized descriptions too.
        for d in deployments.values() {
            let project = &d.model.project;
            if !projects.contains_key(project) {
                let description = synthesized_description(project, &deployments)?;
                projects.insert(project.clone(), description);
            }
        }

        let mut typekits = HashMap::new();
        for t in &settings.catalog.typekits {
            let registry_path = settings.canonical_path(&t.registry_file);
            let typelist_path = settings.canonical_path(&t.typelist_file);
            let registry = TypekitRegistry {
                registry: fs::read_to_string(&registry_path)
                    .with_context(|| format!("reading typekit registry {:?}", registry_path))?,
                typelist: fs::read_to_string(&typelist_path)
                    .with_context(|| format!("reading typekit typelist {:?}", typelist_path))?,
            };
            if typekits.insert(t.name.clone(), registry).is_some() {
                bail!("typekit {:?} is defined twice", t.name);
            }
        }

        Ok(Catalog {
            projects,
            deployments,
            typekits,
            loaded_projects: HashSet::new(),
            loaded_typekits: HashSet::new(),
        })
    }

    pub fn deployment(&self, name: &str) -> Result<&Deployment, NotFound> {
        self.deployments
            .get(name)
            .ok_or_else(|| NotFound::Deployment(name.to_string()))
    }

    /// Marks a project loaded, so long as this server knows it. Loading is
    /// memoized; repeat loads are no-ops.
    pub fn load_project(&mut self, name: &str) -> Result<(), NotFound> {
        if !self.projects.contains_key(name) {
            return Err(NotFound::Project(name.to_string()));
        }
        if self.loaded_projects.insert(name.to_string()) {
            info!("loaded project"; "project" => name);
        } else {
            debug!("project was already loaded"; "project" => name);
        }
        Ok(())
    }

    /// Marks a typekit preloaded. Memoized like [`Catalog::load_project`].
    pub fn preload_typekit(&mut self, name: &str) -> Result<(), NotFound> {
        if !self.typekits.contains_key(name) {
            return Err(NotFound::Typekit(name.to_string()));
        }
        if self.loaded_typekits.insert(name.to_string()) {
            info!("preloaded typekit"; "typekit" => name);
        } else {
            debug!("typekit was already preloaded"; "typekit" => name);
        }
        Ok(())
    }

    /// The handshake payload: everything this server can serve, plus its
    /// own pid.
    pub fn info(&self, server_pid: u32) -> InfoBundle {
        InfoBundle {
            projects: self.projects.clone(),
            deployments: self
                .deployments
                .iter()
                .map(|(name, d)| (name.clone(), d.model.project.clone()))
                .collect(),
            typekits: self.typekits.clone(),
            server_pid,
        }
    }
}

fn synthesized_description(
    project: &str,
    deployments: &HashMap<String, Deployment>,
) -> Result<String> {
    let mut models: Vec<DeploymentModel> = deployments
        .values()
        .filter(|d| d.model.project == project)
        .map(|d| d.model.clone())
        .collect();
    models.sort_by(|a, b| a.name.cmp(&b.name));
    ProjectDescription {
        name: project.to_string(),
        deployments: models,
    }
    .render()
}
