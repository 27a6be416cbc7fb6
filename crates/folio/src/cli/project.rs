//! Tree and metadata editing commands.
//!
//! Each command attaches to the project through a coordinator, applies its
//! change, and detaches. In server mode the change is replicated while
//! attached; offline it is persisted and reaches the server on the next
//! attach.

use std::sync::Arc;

use indexmap::IndexMap;

use folio_core::api::ProjectDescriptor;
use folio_core::background_worker::{BackgroundSyncWorker, OfflineProjectStore};
use folio_core::config::SyncMode;
use folio_core::connectivity::Connectivity;
use folio_core::coordinator::NewElement;
use folio_core::model::{Element, ElementType, ProjectMeta};
use folio_core::project_key::ProjectKey;

use crate::cli::{CliError, CliResult, Context};

pub async fn handle_tree(ctx: &Context, key: &ProjectKey, json: bool) -> CliResult {
    let coordinator = ctx.open(key).await?;
    let elements = coordinator.elements();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&elements).map_err(folio_core::error::FolioError::from)?
        );
    } else {
        let meta = coordinator.project_meta();
        println!("{}", meta.name.as_deref().unwrap_or(&key.to_string()));
        print!("{}", render_tree(&elements));
        println!("({} elements, {})", elements.len(), coordinator.sync_phase());
    }
    ctx.close(coordinator).await;
    Ok(())
}

pub async fn handle_add(
    ctx: &Context,
    key: &ProjectKey,
    element_type: ElementType,
    name: String,
    parent: Option<String>,
    schema: Option<String>,
) -> CliResult {
    let coordinator = ctx.open(key).await?;
    let mut new = NewElement::new(element_type, name);
    if let Some(parent) = parent {
        new = new.under(parent);
    }
    if let Some(schema) = schema {
        new = new.with_schema(schema);
    }
    let result = coordinator.add_element(new).await;
    ctx.close(coordinator).await;

    let element = result?;
    println!("✓ Added {} '{}' [{}]", element.element_type, element.name, element.id);
    Ok(())
}

pub async fn handle_rm(ctx: &Context, key: &ProjectKey, id: &str) -> CliResult {
    let coordinator = ctx.open(key).await?;
    let result = coordinator.delete_element(id);
    ctx.close(coordinator).await;

    let removed = result?;
    println!("✓ Removed {} element(s)", removed.len());
    Ok(())
}

pub async fn handle_mv(
    ctx: &Context,
    key: &ProjectKey,
    id: &str,
    index: usize,
    level: u32,
) -> CliResult {
    let coordinator = ctx.open(key).await?;
    let result = coordinator.move_element(id, index, level);
    ctx.close(coordinator).await;

    result?;
    println!("✓ Moved {} to position {} at level {}", id, index, level);
    Ok(())
}

pub async fn handle_rename(ctx: &Context, key: &ProjectKey, id: &str, name: &str) -> CliResult {
    let coordinator = ctx.open(key).await?;
    let result = coordinator.rename_element(id, name);
    ctx.close(coordinator).await;

    result?;
    println!("✓ Renamed {} to '{}'", id, name);
    Ok(())
}

pub async fn handle_meta(ctx: &Context, key: &ProjectKey, assignments: &[String]) -> CliResult {
    let fields = parse_assignments(assignments)?;
    let coordinator = ctx.open(key).await?;
    let result = if fields.is_empty() {
        Ok(())
    } else {
        coordinator.update_project_meta(fields)
    };
    let meta = coordinator.project_meta();
    ctx.close(coordinator).await;

    result?;
    print_meta(&meta);
    Ok(())
}

/// Create a project in the offline cache, then try to register it.
pub async fn handle_new(
    ctx: &Context,
    slug: String,
    title: String,
    description: Option<String>,
    owner: Option<String>,
) -> CliResult {
    let owner = match owner {
        Some(owner) => owner,
        None => ctx.username()?,
    };
    let mut descriptor = ProjectDescriptor::new(owner, slug, title);
    descriptor.description = description;
    let key = descriptor.key()?;

    let projects = OfflineProjectStore::new(ctx.store());
    projects.create_offline(descriptor.clone())?;
    println!("✓ Created {} locally", key);

    let coordinator = ctx.open(&key).await?;
    let mut fields = IndexMap::new();
    fields.insert(ProjectMeta::NAME.to_string(), descriptor.title.clone());
    if let Some(description) = &descriptor.description {
        fields.insert(ProjectMeta::DESCRIPTION.to_string(), description.clone());
    }
    let result = coordinator.update_project_meta(fields);
    ctx.close(coordinator).await;
    result?;

    if ctx.mode == SyncMode::Server
        && let Some(api) = ctx.api()
    {
        let worker =
            BackgroundSyncWorker::new(projects, Arc::new(api), Connectivity::default(), ctx.mode);
        match worker.sync_pending_items().await {
            Some(report) if report.created.contains(&key.to_string()) => {
                println!("✓ Registered {} with the server", key);
            }
            Some(report) => {
                if let Some(error) = report.errors.get(&key.to_string()) {
                    println!("Server registration deferred: {}", error);
                }
            }
            None => {}
        }
    } else {
        println!("Run 'folio worker' once online to register it with the server.");
    }
    Ok(())
}

fn parse_assignments(assignments: &[String]) -> CliResult<IndexMap<String, String>> {
    let mut fields = IndexMap::new();
    for assignment in assignments {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| CliError::Usage(format!("Expected KEY=VALUE, got '{}'", assignment)))?;
        if key.is_empty() {
            return Err(CliError::Usage(format!("Empty key in '{}'", assignment)));
        }
        fields.insert(key.to_string(), value.to_string());
    }
    Ok(fields)
}

fn print_meta(meta: &ProjectMeta) {
    let field = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());
    println!("Name:        {}", field(&meta.name));
    println!("Description: {}", field(&meta.description));
    println!("Cover:       {}", field(&meta.cover_media_id));
    println!("Updated:     {}", field(&meta.updated_at));
}

/// Indented outline of a preorder element list.
fn render_tree(elements: &[Element]) -> String {
    let mut out = String::new();
    for element in elements {
        let marker = match element.element_type {
            ElementType::Folder => '+',
            ElementType::Item => '-',
            ElementType::Worldbuilding => '*',
        };
        out.push_str(&"  ".repeat(element.level as usize));
        out.push_str(&format!("{} {}  [{}]\n", marker, element.name, element.id));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el(id: &str, element_type: ElementType, level: u32) -> Element {
        let mut element = Element::new(element_type, id.to_uppercase());
        element.id = id.to_string();
        element.level = level;
        element
    }

    #[test]
    fn test_render_tree() {
        let elements = vec![
            el("a", ElementType::Folder, 0),
            el("b", ElementType::Item, 1),
            el("c", ElementType::Worldbuilding, 0),
        ];
        assert_eq!(render_tree(&elements), "+ A  [a]\n  - B  [b]\n* C  [c]\n");
    }

    #[test]
    fn test_parse_assignments() {
        let fields = parse_assignments(&["name=Novel".into(), "description=".into()]).unwrap();
        assert_eq!(fields.get("name").map(String::as_str), Some("Novel"));
        assert_eq!(fields.get("description").map(String::as_str), Some(""));
        assert!(parse_assignments(&["name".into()]).is_err());
        assert!(parse_assignments(&["=x".into()]).is_err());
    }
}
