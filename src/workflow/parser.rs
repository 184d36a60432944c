//! Workflow Parser
//!
//! Loads `module` and `flow` documents from YAML (or JSON) text.
//!
//! Parsing happens in two stages: the raw text is first read into an
//! untyped YAML tree so that structural problems (missing `kind`, a
//! `steps` key that is not a list, ...) can be reported precisely, then
//! the tree is converted into [`WorkflowDocument`] and validated.

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde_yaml::Value;

use super::model::{DocumentKind, WorkflowDocument};
use super::validator::{quick_validate, validate_document};
use crate::error::{Location, Result, WorkflowError};

/// Parses a workflow document from text.
///
/// # Errors
///
/// * `MalformedDocument` - the text is not valid YAML/JSON
/// * `SchemaViolation` - `name` or `kind` is missing or invalid, the
///   node list is not a sequence, or a node fails validation
///
/// # Example
///
/// ```
/// use osmflow::workflow::{load, DocumentKind};
///
/// let doc = load("name: hello\nkind: module\nsteps:\n  - name: greet\n    type: bash\n    command: echo hi\n").unwrap();
/// assert_eq!(doc.kind, DocumentKind::Module);
/// assert_eq!(doc.steps.len(), 1);
/// ```
pub fn load(raw_text: &str) -> Result<WorkflowDocument> {
    let document = parse(raw_text)?;
    validate_document(&document)?;
    Ok(document)
}

/// Reads the text into a typed document without node validation.
fn parse(raw_text: &str) -> Result<WorkflowDocument> {
    let tree: Value = serde_yaml::from_str(raw_text).map_err(|e| {
        let location = e.location();
        WorkflowError::MalformedDocument {
            location: Location {
                path: None,
                line: location.as_ref().map(|l| l.line()),
                column: location.as_ref().map(|l| l.column()),
            },
            message: e.to_string(),
        }
    })?;

    let kind = check_structure(&tree)?;
    debug!("Document structure ok ({})", kind);

    serde_yaml::from_value(tree).map_err(|e| WorkflowError::schema(None, format!("invalid document: {}", e)))
}

/// Reads a workflow file and lists every validation problem in it.
///
/// Structural errors (bad YAML, missing `kind`) are still returned as
/// `Err`; everything past that lands in the list.
pub fn lint_workflow(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let raw_text = fs::read_to_string(path)?;
    let document = parse(&raw_text).map_err(|e| e.with_source(Some(&path.to_path_buf())))?;
    Ok(quick_validate(&document))
}

/// Loads and validates a workflow document from a file.
///
/// The returned document remembers its path so that module references
/// in a flow resolve relative to it.
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDocument> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let raw_text = fs::read_to_string(path).map_err(|e| {
        WorkflowError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read workflow file '{}': {}", path.display(), e),
        ))
    })?;

    debug!("Document loaded ({} bytes)", raw_text.len());

    let source = path.to_path_buf();
    let mut document = load(&raw_text).map_err(|e| e.with_source(Some(&source)))?;
    document.source_path = Some(source);

    info!(
        "Loaded {} '{}' with {} nodes",
        document.kind,
        document.name,
        document.len()
    );
    Ok(document)
}

/// Checks the top-level keys before typed conversion.
fn check_structure(tree: &Value) -> Result<DocumentKind> {
    if !tree.is_mapping() {
        return Err(WorkflowError::schema(None, "document must be a mapping"));
    }

    let name = match tree.get("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.as_str(),
        Some(Value::String(_)) | None | Some(Value::Null) => {
            return Err(WorkflowError::schema(None, "missing 'name'"))
        }
        Some(_) => return Err(WorkflowError::schema(None, "'name' must be a string")),
    };

    let kind = match tree.get("kind").and_then(Value::as_str) {
        Some("module") => DocumentKind::Module,
        Some("flow") => DocumentKind::Flow,
        Some(other) => {
            return Err(WorkflowError::schema(
                Some(name),
                format!("invalid kind '{}' (expected 'module' or 'flow')", other),
            ))
        }
        None => return Err(WorkflowError::schema(Some(name), "missing 'kind'")),
    };

    for key in ["params", "steps", "modules"] {
        match tree.get(key) {
            None | Some(Value::Null) | Some(Value::Sequence(_)) => {}
            Some(_) => {
                return Err(WorkflowError::schema(
                    Some(name),
                    format!("'{}' must be a sequence", key),
                ))
            }
        }
    }

    let required = match kind {
        DocumentKind::Module => "steps",
        DocumentKind::Flow => "modules",
    };
    if !matches!(tree.get(required), Some(Value::Sequence(_))) {
        return Err(WorkflowError::schema(
            Some(name),
            format!("{} documents need a '{}' sequence", kind, required),
        ));
    }

    Ok(kind)
}
