//! Command-line surface over [`SessionController`].
//!
//! Settings resolve with the following precedence (highest to lowest):
//! 1. `ARBOR_*` environment variables
//! 2. `settings.json` (default under the user config dir, or `--config`)
//! 3. Built-in defaults

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use arbor_core::{CoreError, Generation, RepairReport, SessionController, TreeIndex};
use arbor_llm::{LlmProvider, ProviderError, create_provider};
use arbor_storage::{
    ConversationId, ConversationRecord, ImportReport, LocalStore, NodeId, NodeRecord,
    SqliteStorage, StorageError, StoreSelection, open_store,
};
use clap::{Parser, Subcommand};
use snafu::{ResultExt, Snafu};

use crate::settings::{ArborSettings, SettingsError, SettingsStore};

/// Branching conversation trees backed by SQLite or a local JSON file
#[derive(Parser, Debug)]
#[command(name = "arbor", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true, env = "ARBOR_VERBOSE")]
    pub verbose: bool,

    /// Print records as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Path to settings.json
    #[arg(long, global = true, env = "ARBOR_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, list, or delete conversations
    #[command(subcommand)]
    Conversation(ConversationCommand),

    /// Create an idle root node, in a new conversation unless one is given
    Root {
        #[arg(long)]
        conversation: Option<ConversationId>,
    },

    /// Send a prompt as the conversation's root, or under `--parent`
    Send {
        conversation: ConversationId,
        prompt: String,
        #[arg(long)]
        parent: Option<NodeId>,
        #[arg(long, default_value = "")]
        model: String,
    },

    /// Add a child under a node and generate its response
    Branch {
        parent: NodeId,
        prompt: String,
        #[arg(long, default_value = "")]
        model: String,
    },

    /// Copy a node's content into a new sibling
    Clone { node: NodeId },

    /// Generate a fresh sibling for a node's prompt
    Regenerate {
        node: NodeId,
        #[arg(long)]
        model: Option<String>,
    },

    /// Rewrite a node's prompt in place, keeping its response and status
    Edit { node: NodeId, prompt: String },

    /// Fork a node's lineage with a new prompt as its sibling
    EditBranch {
        node: NodeId,
        prompt: String,
        #[arg(long)]
        model: Option<String>,
    },

    /// Generate the response of an idle node
    Submit { node: NodeId },

    /// Delete a node and all of its descendants
    Delete { node: NodeId },

    /// Delete every descendant of a node, keeping the node
    Clear { node: NodeId },

    /// Show one node
    Show { node: NodeId },

    /// Print the path from the root down to a node
    Lineage { node: NodeId },

    Children { node: NodeId },

    Siblings { node: NodeId },

    /// Follow first children down to a leaf
    Leaf { node: NodeId },

    /// Print a conversation as an indented tree
    Tree { conversation: ConversationId },

    /// Report structural defects in a conversation
    Check { conversation: ConversationId },

    /// Rewrite a conversation's nodes until it is a single well-formed tree
    Repair { conversation: ConversationId },

    /// List the models offered by the configured provider
    Models,

    /// Copy the local JSON store into the configured SQLite database
    ImportLocal {
        /// Local store file; defaults to the configured one
        #[arg(long)]
        from: Option<PathBuf>,
    },

    /// Inspect or change settings.json
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
pub enum ConversationCommand {
    New {
        #[arg(long, default_value = "")]
        title: String,
    },
    List,
    Delete { conversation: ConversationId },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    Show,
    Path,
    Set { key: String, value: String },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("settings error on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to open node store on `{stage}`: {source}"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to configure provider on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("{source}"))]
    Session {
        stage: &'static str,
        source: CoreError,
    },
    #[snafu(display("`import-local` needs `database_url` to be set on `{stage}`"))]
    ImportNeedsSqlite { stage: &'static str },
    #[snafu(display("failed to render output on `{stage}`: {source}"))]
    Render {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    Output {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type CliResult<T> = Result<T, CliError>;

pub async fn run(cli: Cli, settings_store: &SettingsStore, out: &mut dyn Write) -> CliResult<()> {
    let json = cli.json;
    let settings = settings_store.settings();

    let command = match cli.command {
        Command::Config(command) => return run_config(command, settings_store, json, out),
        Command::Models => {
            let provider = provider_for(&settings)?;
            return print_models(provider.as_ref(), json, out);
        }
        Command::ImportLocal { from } => {
            return import_local(&settings, from, json, out).await;
        }
        command => command,
    };

    let controller = open_controller(&settings).await?;
    let mut printer = Printer { out, json };

    match command {
        Command::Conversation(ConversationCommand::New { title }) => {
            let conversation = controller
                .create_conversation(&title)
                .await
                .context(SessionSnafu { stage: "conversation-new" })?;
            printer.conversations(&[conversation])
        }
        Command::Conversation(ConversationCommand::List) => {
            let conversations = controller
                .list_conversations()
                .await
                .context(SessionSnafu { stage: "conversation-list" })?;
            printer.conversations(&conversations)
        }
        Command::Conversation(ConversationCommand::Delete { conversation }) => {
            controller
                .delete_conversation(conversation)
                .await
                .context(SessionSnafu { stage: "conversation-delete" })?;
            printer.line(&format!("deleted conversation {conversation}"))
        }
        Command::Root { conversation } => {
            let root = controller
                .create_root(conversation)
                .await
                .context(SessionSnafu { stage: "root" })?;
            printer.node(&root)
        }
        Command::Send {
            conversation,
            prompt,
            parent,
            model,
        } => {
            let generation = controller
                .send(conversation, parent, &prompt, &model)
                .await
                .context(SessionSnafu { stage: "send" })?;
            printer.node(&settle(generation, "send").await?)
        }
        Command::Branch {
            parent,
            prompt,
            model,
        } => {
            let generation = controller
                .branch(parent, &prompt, &model)
                .await
                .context(SessionSnafu { stage: "branch" })?;
            printer.node(&settle(generation, "branch").await?)
        }
        Command::Clone { node } => {
            let clone = controller
                .clone_node(node)
                .await
                .context(SessionSnafu { stage: "clone" })?;
            printer.node(&clone)
        }
        Command::Regenerate { node, model } => {
            let generation = controller
                .regenerate(node, model.as_deref())
                .await
                .context(SessionSnafu { stage: "regenerate" })?;
            printer.node(&settle(generation, "regenerate").await?)
        }
        Command::Edit { node, prompt } => {
            let edited = controller
                .edit_prompt(node, &prompt)
                .await
                .context(SessionSnafu { stage: "edit" })?;
            printer.node(&edited)
        }
        Command::EditBranch {
            node,
            prompt,
            model,
        } => {
            let generation = controller
                .edit_as_branch(node, &prompt, model.as_deref())
                .await
                .context(SessionSnafu { stage: "edit-branch" })?;
            printer.node(&settle(generation, "edit-branch").await?)
        }
        Command::Submit { node } => {
            let generation = controller
                .submit(node)
                .await
                .context(SessionSnafu { stage: "submit" })?;
            printer.node(&settle(generation, "submit").await?)
        }
        Command::Delete { node } => {
            let removed = controller
                .delete_subtree(node)
                .await
                .context(SessionSnafu { stage: "delete" })?;
            printer.removed(&removed)
        }
        Command::Clear { node } => {
            let removed = controller
                .clear_children(node)
                .await
                .context(SessionSnafu { stage: "clear" })?;
            printer.removed(&removed)
        }
        Command::Show { node } => {
            let node = controller
                .get_node(node)
                .await
                .context(SessionSnafu { stage: "show" })?;
            printer.node(&node)
        }
        Command::Lineage { node } => {
            let lineage = controller
                .get_lineage(node)
                .await
                .context(SessionSnafu { stage: "lineage" })?;
            printer.nodes(&lineage)
        }
        Command::Children { node } => {
            let children = controller
                .get_children(node)
                .await
                .context(SessionSnafu { stage: "children" })?;
            printer.nodes(&children)
        }
        Command::Siblings { node } => {
            let siblings = controller
                .get_siblings(node)
                .await
                .context(SessionSnafu { stage: "siblings" })?;
            printer.nodes(&siblings)
        }
        Command::Leaf { node } => {
            let leaf = controller
                .first_leaf(node)
                .await
                .context(SessionSnafu { stage: "leaf" })?;
            printer.node(&leaf)
        }
        Command::Tree { conversation } => {
            let index = controller
                .get_tree(conversation)
                .await
                .context(SessionSnafu { stage: "tree" })?;
            printer.tree(&index)
        }
        Command::Check { conversation } => {
            let violations = controller
                .validate_scope(conversation)
                .await
                .context(SessionSnafu { stage: "check" })?;
            if violations.is_empty() {
                return printer.line(&format!("conversation {conversation} is well-formed"));
            }
            for violation in violations {
                printer.line(&format!("{violation:?}"))?;
            }
            Ok(())
        }
        Command::Repair { conversation } => {
            let report = controller
                .repair_scope(conversation)
                .await
                .context(SessionSnafu { stage: "repair" })?;
            printer.repair(&report)
        }
        Command::Config(_) | Command::Models | Command::ImportLocal { .. } => Ok(()),
    }
}

async fn open_controller(settings: &ArborSettings) -> CliResult<SessionController> {
    let store = open_store(settings.store_selection())
        .await
        .context(OpenStoreSnafu { stage: "open-node-store" })?;
    let provider = provider_for(settings)?;
    Ok(SessionController::new(store, provider))
}

fn provider_for(settings: &ArborSettings) -> CliResult<Arc<dyn LlmProvider>> {
    create_provider(settings.to_provider_config()).context(ProviderSnafu {
        stage: "create-provider",
    })
}

/// The process exits once the command returns, so every generation is awaited here.
async fn settle(generation: Generation, stage: &'static str) -> CliResult<NodeRecord> {
    let node_id = generation.node_id();
    tracing::debug!(node_id = %node_id, stage, "waiting for generation");
    generation.wait().await.context(SessionSnafu { stage })
}

fn run_config(
    command: ConfigCommand,
    settings_store: &SettingsStore,
    json: bool,
    out: &mut dyn Write,
) -> CliResult<()> {
    let mut printer = Printer { out, json };
    match command {
        ConfigCommand::Show => printer.settings(&settings_store.settings().redacted()),
        ConfigCommand::Path => {
            printer.line(&settings_store.config_path().display().to_string())
        }
        ConfigCommand::Set { key, value } => {
            let updated = settings_store
                .settings()
                .as_ref()
                .clone()
                .with_value(&key, &value)
                .context(SettingsSnafu { stage: "config-set" })?;
            settings_store
                .update(updated)
                .context(SettingsSnafu { stage: "config-set" })?;
            printer.settings(&settings_store.settings().redacted())
        }
    }
}

fn print_models(provider: &dyn LlmProvider, json: bool, out: &mut dyn Write) -> CliResult<()> {
    let mut printer = Printer { out, json };
    if json {
        let ids = provider
            .models()
            .iter()
            .map(|model| model.id.as_str())
            .collect::<Vec<_>>();
        return printer.render_json(&ids);
    }
    for model in provider.models() {
        let marker = if model.id == provider.default_model() {
            "*"
        } else {
            " "
        };
        printer.line(&format!("{marker} {} ({})", model.id, model.name))?;
    }
    Ok(())
}

async fn import_local(
    settings: &ArborSettings,
    from: Option<PathBuf>,
    json: bool,
    out: &mut dyn Write,
) -> CliResult<()> {
    let StoreSelection::Sqlite { database_location } = settings.store_selection() else {
        return ImportNeedsSqliteSnafu {
            stage: "import-local",
        }
        .fail();
    };

    let source_path = from.unwrap_or_else(|| settings.local_store_file());
    let source = LocalStore::open(&source_path).context(OpenStoreSnafu {
        stage: "open-import-source",
    })?;
    let target = SqliteStorage::open(&database_location)
        .await
        .context(OpenStoreSnafu {
            stage: "open-import-target",
        })?;
    let report = target.import_from(&source).await.context(OpenStoreSnafu {
        stage: "import-local-store",
    })?;

    Printer { out, json }.import(&report)
}

struct Printer<'a> {
    out: &'a mut dyn Write,
    json: bool,
}

impl Printer<'_> {
    fn line(&mut self, text: &str) -> CliResult<()> {
        writeln!(self.out, "{text}").context(OutputSnafu {
            stage: "write-line",
        })
    }

    fn render_json<T: serde::Serialize + ?Sized>(&mut self, value: &T) -> CliResult<()> {
        let text = serde_json::to_string_pretty(value).context(RenderSnafu {
            stage: "render-json",
        })?;
        self.line(&text)
    }

    fn node(&mut self, node: &NodeRecord) -> CliResult<()> {
        if self.json {
            return self.render_json(node);
        }
        self.line(&node_line(node, 0))?;
        if let Some(prompt) = &node.prompt {
            self.line(&format!("  prompt: {prompt}"))?;
        }
        if let Some(response) = &node.response {
            self.line(&format!("  response: {response}"))?;
        }
        if let Some(error) = &node.error {
            self.line(&format!("  error: {error}"))?;
        }
        Ok(())
    }

    fn nodes(&mut self, nodes: &[NodeRecord]) -> CliResult<()> {
        if self.json {
            return self.render_json(nodes);
        }
        for node in nodes {
            self.line(&node_line(node, 0))?;
        }
        Ok(())
    }

    fn conversations(&mut self, conversations: &[ConversationRecord]) -> CliResult<()> {
        if self.json {
            return self.render_json(conversations);
        }
        for conversation in conversations {
            self.line(&format!("{}  {}", conversation.id, conversation.title))?;
        }
        Ok(())
    }

    fn removed(&mut self, removed: &[NodeId]) -> CliResult<()> {
        if self.json {
            return self.render_json(removed);
        }
        self.line(&format!("removed {} node(s)", removed.len()))
    }

    fn tree(&mut self, index: &TreeIndex) -> CliResult<()> {
        if self.json {
            return self.render_json(&index.nodes());
        }
        for (node, depth) in tree_rows(index) {
            self.line(&node_line(node, depth))?;
        }
        Ok(())
    }

    fn repair(&mut self, report: &RepairReport) -> CliResult<()> {
        if report.is_clean() {
            return self.line(&format!(
                "conversation {} needed no repair",
                report.conversation_id
            ));
        }
        let kept = report
            .kept_root
            .map(|root| root.to_string())
            .unwrap_or_else(|| "none".to_string());
        self.line(&format!(
            "kept root {kept}, reparented {}, rewrote {}",
            report.reparented.len(),
            report.rewritten.len()
        ))
    }

    fn import(&mut self, report: &ImportReport) -> CliResult<()> {
        if report.already_migrated {
            return self.line("target database already holds conversations; nothing imported");
        }
        self.line(&format!(
            "imported {} conversation(s), {} node(s), skipped {}",
            report.imported_conversations, report.imported_nodes, report.skipped_nodes
        ))?;
        for warning in &report.warnings {
            self.line(&format!("  skipped {}: {}", warning.node_id, warning.reason))?;
        }
        Ok(())
    }

    fn settings(&mut self, settings: &ArborSettings) -> CliResult<()> {
        if self.json {
            return self.render_json(settings);
        }
        self.line(&format!("provider_id = {}", settings.provider_id))?;
        self.line(&format!("api_key = {}", settings.api_key))?;
        self.line(&format!("endpoint = {}", settings.endpoint))?;
        self.line(&format!("default_model = {}", settings.default_model))?;
        self.line(&format!("database_url = {}", settings.database_url))?;
        self.line(&format!("local_store_path = {}", settings.local_store_path))
    }
}

fn node_line(node: &NodeRecord, depth: usize) -> String {
    format!(
        "{}{} [{}] {}: {}",
        "  ".repeat(depth),
        node.id,
        node.status,
        node.title,
        node.summary
    )
}

/// Depth-first rows from every root; nodes unreachable from a root are listed last at depth 0.
fn tree_rows(index: &TreeIndex) -> Vec<(&NodeRecord, usize)> {
    let mut rows = Vec::with_capacity(index.len());
    let mut seen = HashSet::new();
    let mut stack = index
        .roots()
        .into_iter()
        .rev()
        .map(|root| (root, 0))
        .collect::<Vec<_>>();

    while let Some((node, depth)) = stack.pop() {
        if !seen.insert(node.id) {
            continue;
        }
        rows.push((node, depth));
        for child in index.children_of(node.id).into_iter().rev() {
            stack.push((child, depth + 1));
        }
    }

    for node in index.nodes() {
        if seen.insert(node.id) {
            rows.push((node, 0));
        }
    }
    rows
}
