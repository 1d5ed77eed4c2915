//! In-memory project data store.
//!
//! The supervisor only reads projects; `ProjectSource` is the seam it reads
//! through. `Catalog` is the implementation backed by `servicerack.toml`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};

use crate::config::{Config, ProjectConfig, ScriptConfig, ServiceConfig};
use crate::errors::CatalogError;
use crate::model::{slugify, Project, ProjectId, Script, Service, ServiceId};

/// Read access to projects and services.
pub trait ProjectSource: Send + Sync {
    fn project(&self, id: &ProjectId) -> Option<Arc<Project>>;

    /// Looks up a service together with its owning project.
    fn service(&self, id: &ServiceId) -> Option<(Arc<Project>, Service)>;

    /// Looks up a project script together with its owning project.
    fn script(&self, _id: &ServiceId) -> Option<(Arc<Project>, Script)> {
        None
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    projects: Vec<Arc<Project>>,
    by_service: HashMap<ServiceId, (usize, usize)>,
    by_script: HashMap<ServiceId, (usize, usize)>,
}

impl Catalog {
    pub fn new(projects: Vec<Project>) -> Result<Self, CatalogError> {
        let mut catalog = Self::default();
        for project in projects {
            if catalog.projects.iter().any(|p| p.id == project.id) {
                return Err(CatalogError::DuplicateProject(project.id));
            }
            let project_idx = catalog.projects.len();
            for (service_idx, service) in project.services.iter().enumerate() {
                if service.project_id != project.id {
                    return Err(CatalogError::ForeignService {
                        service: service.id.clone(),
                        declared: service.project_id.clone(),
                        actual: project.id.clone(),
                    });
                }
                if catalog
                    .by_service
                    .insert(service.id.clone(), (project_idx, service_idx))
                    .is_some()
                {
                    return Err(CatalogError::DuplicateService(service.id.clone()));
                }
            }
            for (script_idx, script) in project.scripts.iter().enumerate() {
                if catalog.by_service.contains_key(&script.id)
                    || catalog
                        .by_script
                        .insert(script.id.clone(), (project_idx, script_idx))
                        .is_some()
                {
                    return Err(CatalogError::DuplicateService(script.id.clone()));
                }
            }
            catalog.projects.push(Arc::new(project));
        }
        Ok(catalog)
    }

    /// Builds the catalog from the `[[project]]` tables of a config file.
    pub fn from_config(config: &Config) -> Result<Self> {
        let projects = config
            .projects
            .iter()
            .map(project_from_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(projects)?)
    }

    pub fn projects(&self) -> &[Arc<Project>] {
        &self.projects
    }

    /// Finds a project by id, then by case-insensitive name.
    pub fn resolve_project(&self, query: &str) -> Result<Arc<Project>> {
        if let Some(project) = self.projects.iter().find(|p| p.id.as_str() == query) {
            return Ok(project.clone());
        }
        let matches: Vec<&Arc<Project>> = self
            .projects
            .iter()
            .filter(|p| p.name.eq_ignore_ascii_case(query))
            .collect();
        match matches.as_slice() {
            [project] => Ok((*project).clone()),
            [] => bail!("project not found: {}", query),
            _ => bail!("project name {} is ambiguous, use its id", query),
        }
    }

    /// Finds a service by id, by `project/name`, or by a name unique across projects.
    pub fn resolve_service(&self, query: &str) -> Result<ServiceId> {
        if let Ok(id) = ServiceId::new(query) {
            if self.by_service.contains_key(&id) {
                return Ok(id);
            }
        }
        if let Some((project_query, name)) = query.split_once('/') {
            let project = self.resolve_project(project_query)?;
            return project
                .services
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(name))
                .map(|s| s.id.clone())
                .ok_or_else(|| anyhow!("service {} not found in {}", name, project.name));
        }
        let matches: Vec<&Service> = self
            .projects
            .iter()
            .flat_map(|p| p.services.iter())
            .filter(|s| s.name.eq_ignore_ascii_case(query))
            .collect();
        match matches.as_slice() {
            [service] => Ok(service.id.clone()),
            [] => bail!("service not found: {}", query),
            _ => bail!("service name {} is ambiguous, use project/name", query),
        }
    }

    /// Finds a script by id or by `project/name`.
    pub fn resolve_script(&self, query: &str) -> Result<ServiceId> {
        if let Ok(id) = ServiceId::new(query) {
            if self.by_script.contains_key(&id) {
                return Ok(id);
            }
        }
        let Some((project_query, name)) = query.split_once('/') else {
            bail!("script not found: {} (use project/name)", query);
        };
        let project = self.resolve_project(project_query)?;
        project
            .scripts
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .map(|s| s.id.clone())
            .ok_or_else(|| anyhow!("script {} not found in {}", name, project.name))
    }
}

impl ProjectSource for Catalog {
    fn project(&self, id: &ProjectId) -> Option<Arc<Project>> {
        self.projects.iter().find(|p| &p.id == id).cloned()
    }

    fn service(&self, id: &ServiceId) -> Option<(Arc<Project>, Service)> {
        let (project_idx, service_idx) = *self.by_service.get(id)?;
        let project = self.projects.get(project_idx)?;
        let service = project.services.get(service_idx)?.clone();
        Some((project.clone(), service))
    }

    fn script(&self, id: &ServiceId) -> Option<(Arc<Project>, Script)> {
        let (project_idx, script_idx) = *self.by_script.get(id)?;
        let project = self.projects.get(project_idx)?;
        let script = project.scripts.get(script_idx)?.clone();
        Some((project.clone(), script))
    }
}

fn project_from_config(config: &ProjectConfig) -> Result<Project> {
    let raw_id = config.id.clone().unwrap_or_else(|| slugify(&config.name));
    let id = ProjectId::new(raw_id)
        .with_context(|| format!("invalid id for project {}", config.name))?;
    let services = config
        .services
        .iter()
        .enumerate()
        .map(|(idx, service)| service_from_config(&id, idx, service))
        .collect::<Result<Vec<_>>>()?;
    let scripts = config
        .scripts
        .iter()
        .map(|script| script_from_config(&id, script))
        .collect::<Result<Vec<_>>>()?;
    Ok(Project {
        id,
        name: config.name.clone(),
        root: config.root.clone(),
        description: config.description.clone(),
        services,
        env: config.env.clone().unwrap_or_default(),
        env_files: config.env_files.clone().unwrap_or_default(),
        scripts,
        created_at: config.created_at,
        last_opened_at: config.last_opened_at,
    })
}

fn service_from_config(project: &ProjectId, idx: usize, config: &ServiceConfig) -> Result<Service> {
    let raw_id = config
        .id
        .clone()
        .unwrap_or_else(|| format!("{}.{}", project, slugify(&config.name)));
    let id = ServiceId::new(raw_id)
        .with_context(|| format!("invalid id for service {}", config.name))?;
    Ok(Service {
        id,
        project_id: project.clone(),
        name: config.name.clone(),
        command: config.command.clone(),
        working_dir: config.working_dir.clone().unwrap_or_default(),
        port: config.port,
        color: config.color.clone(),
        order: config.order.unwrap_or(idx as u32),
        env: config.env.clone().unwrap_or_default(),
        modes: config.modes.clone().unwrap_or_default(),
        default_mode: config.default_mode.clone(),
        extra_args: config.extra_args.clone(),
        arg_presets: config.arg_presets.clone().unwrap_or_else(BTreeMap::new),
        default_arg_preset: config.default_arg_preset.clone(),
    })
}

fn script_from_config(project: &ProjectId, config: &ScriptConfig) -> Result<Script> {
    let raw_id = config
        .id
        .clone()
        .unwrap_or_else(|| format!("{}.script.{}", project, slugify(&config.name)));
    let id = ServiceId::new(raw_id)
        .with_context(|| format!("invalid id for script {}", config.name))?;
    Ok(Script {
        id,
        name: config.name.clone(),
        command: config.command.clone(),
        working_dir: config.working_dir.clone().unwrap_or_else(|| ".".into()),
        description: config.description.clone(),
    })
}
