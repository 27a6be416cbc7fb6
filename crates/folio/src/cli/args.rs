//! Command-line argument structures and enums

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use folio_core::model::ElementType;
use folio_core::project_key::{KeySeparator, ProjectKey};

#[derive(Parser)]
#[command(name = "folio")]
#[command(version)]
#[command(about = "Inspect and sync Folio writing projects", long_about = None)]
pub struct Cli {
    /// Use this config file instead of the default location
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Force local mode even when a server is configured
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Parse `owner/slug`.
pub fn parse_project(value: &str) -> Result<ProjectKey, String> {
    ProjectKey::parse(value, KeySeparator::Slash).map_err(|e| e.to_string())
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the element tree of a project
    Tree {
        /// Project as owner/slug
        #[arg(value_parser = parse_project)]
        project: ProjectKey,

        /// Print the elements as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add an element
    Add {
        #[arg(value_parser = parse_project)]
        project: ProjectKey,

        /// folder, item or worldbuilding
        element_type: ElementType,

        name: String,

        /// Insert as the first child of this element
        #[arg(short, long)]
        parent: Option<String>,

        /// Worldbuilding template id
        #[arg(short, long)]
        schema: Option<String>,
    },

    /// Delete an element and everything below it
    #[command(alias = "delete")]
    Rm {
        #[arg(value_parser = parse_project)]
        project: ProjectKey,

        id: String,
    },

    /// Move an element (with its subtree)
    Mv {
        #[arg(value_parser = parse_project)]
        project: ProjectKey,

        id: String,

        /// Target position once the subtree is taken out
        #[arg(short, long)]
        index: usize,

        /// New depth of the moved element
        #[arg(short, long)]
        level: u32,
    },

    /// Rename an element
    Rename {
        #[arg(value_parser = parse_project)]
        project: ProjectKey,

        id: String,

        name: String,
    },

    /// Show or edit project metadata
    Meta {
        #[arg(value_parser = parse_project)]
        project: ProjectKey,

        /// Set a field (key=value); an empty value removes it
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// Create a project locally; the worker registers it with the server
    New {
        /// Project slug
        slug: String,

        title: String,

        #[arg(short, long)]
        description: Option<String>,

        /// Owner (defaults to the configured username)
        #[arg(short, long)]
        owner: Option<String>,
    },

    /// Refresh every project (or the given ones) stage by stage
    SyncAll {
        #[arg(value_parser = parse_project)]
        projects: Vec<ProjectKey>,
    },

    /// Replay projects created or edited offline
    Worker {
        /// Run once and exit instead of waiting for connectivity changes
        #[arg(long)]
        once: bool,
    },

    /// Stay attached to a project and print sync activity until Ctrl-C
    Watch {
        #[arg(value_parser = parse_project)]
        project: ProjectKey,

        /// Keep the project's media library in sync as well
        #[arg(long)]
        media: bool,
    },

    /// Show or change configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the configuration
    Show,

    /// Set a field (sync_mode, websocket_url, api_url, session_token, username, data_dir)
    Set { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add() {
        let cli = Cli::parse_from([
            "folio", "add", "alice/novel", "folder", "Chapters", "--parent", "abc",
        ]);
        match cli.command {
            Commands::Add {
                project,
                element_type,
                name,
                parent,
                ..
            } => {
                assert_eq!(project, ProjectKey::new("alice", "novel").unwrap());
                assert_eq!(element_type, ElementType::Folder);
                assert_eq!(name, "Chapters");
                assert_eq!(parent.as_deref(), Some("abc"));
            }
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn test_rejects_malformed_project() {
        assert!(Cli::try_parse_from(["folio", "tree", "novel"]).is_err());
        assert!(Cli::try_parse_from(["folio", "tree", "/novel"]).is_err());
    }
}
