//! Provisioning targets and the resource-path grammar.
//!
//! A target names one instance and, optionally, one database inside it. Paths
//! follow `projects/<project>/instances/<instance>[/databases/<database>]`.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

const PROJECTS: &str = "projects";
const INSTANCES: &str = "instances";
const DATABASES: &str = "databases";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ProvisioningTarget {
    pub project: String,
    pub instance: String,
    /// Empty for instance-only provisioning.
    pub database: String,
}

impl ProvisioningTarget {
    pub fn new(
        project: impl Into<String>,
        instance: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            instance: instance.into(),
            database: database.into(),
        }
    }

    pub fn has_database(&self) -> bool {
        !self.database.is_empty()
    }

    pub fn instance_path(&self) -> String {
        instance_path(&self.project, &self.instance)
    }

    pub fn database_path(&self) -> Option<String> {
        if self.has_database() {
            Some(database_path(&self.project, &self.instance, &self.database))
        } else {
            None
        }
    }
}

impl fmt::Display for ProvisioningTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.database_path() {
            Some(path) => f.write_str(&path),
            None => f.write_str(&self.instance_path()),
        }
    }
}

pub fn instance_path(project: &str, instance: &str) -> String {
    format!("{PROJECTS}/{project}/{INSTANCES}/{instance}")
}

pub fn database_path(project: &str, instance: &str, database: &str) -> String {
    format!("{}/{DATABASES}/{database}", instance_path(project, instance))
}

/// Why a resource path was not accepted.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PathRejection {
    #[error("resource path is empty")]
    Empty,
    #[error("resource path must start with 'projects/'")]
    MissingProjects,
    #[error("expected 'instances' after the project id, found '{0}'")]
    MissingInstances(String),
    #[error("expected 'databases' after the instance id, found '{0}'")]
    MissingDatabases(String),
    #[error("resource path is truncated")]
    Truncated,
    #[error("{0} id is empty")]
    EmptyId(&'static str),
    #[error("unexpected segments after the database id")]
    TrailingSegments,
}

/// Parses one fully-qualified resource path into a target.
pub fn parse_resource_path(path: &str) -> Result<ProvisioningTarget, PathRejection> {
    let path = path.trim();
    if path.is_empty() {
        return Err(PathRejection::Empty);
    }
    let segments = path.split('/').collect::<Vec<_>>();
    if segments[0] != PROJECTS {
        return Err(PathRejection::MissingProjects);
    }
    if segments.len() < 4 {
        return Err(PathRejection::Truncated);
    }
    if segments[2] != INSTANCES {
        return Err(PathRejection::MissingInstances(segments[2].to_string()));
    }
    let project = non_empty(segments[1], "project")?;
    let instance = non_empty(segments[3], "instance")?;
    match segments.len() {
        4 => Ok(ProvisioningTarget::new(project, instance, "")),
        5 => Err(PathRejection::Truncated),
        6 => {
            if segments[4] != DATABASES {
                return Err(PathRejection::MissingDatabases(segments[4].to_string()));
            }
            let database = non_empty(segments[5], "database")?;
            Ok(ProvisioningTarget::new(project, instance, database))
        }
        _ => {
            if segments[4] != DATABASES {
                return Err(PathRejection::MissingDatabases(segments[4].to_string()));
            }
            Err(PathRejection::TrailingSegments)
        }
    }
}

fn non_empty<'a>(value: &'a str, kind: &'static str) -> Result<&'a str, PathRejection> {
    if value.is_empty() {
        Err(PathRejection::EmptyId(kind))
    } else {
        Ok(value)
    }
}

/// Raw identifiers as they arrive from flags or the environment.
#[derive(Clone, Debug, Default)]
pub struct TargetInputs {
    pub project: String,
    pub instance: String,
    pub database: String,
    /// Comma-separated resource paths.
    pub resource_paths: String,
}

impl TargetInputs {
    pub fn targets(&self) -> Vec<ProvisioningTarget> {
        parse_targets(
            &self.project,
            &self.instance,
            &self.database,
            &self.resource_paths,
        )
    }
}

/// Builds the target list from the primary triple and the resource-path list.
///
/// Never fails: a primary triple without project or instance is ignored and
/// malformed list entries are dropped with a warning. Order is primary first,
/// then list entries as written. Duplicates are left for the orchestrator.
pub fn parse_targets(
    project: &str,
    instance: &str,
    database: &str,
    resource_paths: &str,
) -> Vec<ProvisioningTarget> {
    let mut targets = Vec::new();
    let (project, instance, database) = (project.trim(), instance.trim(), database.trim());
    if !project.is_empty() && !instance.is_empty() {
        targets.push(ProvisioningTarget::new(project, instance, database));
    }
    for entry in resource_paths.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match parse_resource_path(entry) {
            Ok(target) => targets.push(target),
            Err(rejection) => {
                tracing::warn!(path = entry, %rejection, "skipping malformed resource path");
            }
        }
    }
    targets
}
