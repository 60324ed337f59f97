use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use workflow_sync::model::{Workflow, WorkflowStatus};
use workflow_sync::structured_logger::SyncEventLog;
use workflow_sync::sync_engine::EventSink;
use workflow_sync::{
    AgentStatusSync, ClientConfig, EmailHydration, EmailHydrator, HttpTransport, Interaction,
    InteractionResolver, Resolution, ResolutionError, SyncPhase, SyncSnapshot, WorkflowSyncEngine,
    WorkflowTransport,
};

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("WFSYNC_GIT_SHA"), ")");

/// How long an email prompt waits for the preview before showing what it has.
const PREVIEW_WAIT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "wfsync")]
#[command(about = "Follow remote workflows and answer their prompts")]
#[command(version = VERSION)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Workflow service base URL (overrides config and WFSYNC_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Bearer token for the workflow service
    #[arg(long, global = true)]
    api_token: Option<String>,

    /// Config file (defaults to ~/.wfsync/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sync a workflow until it completes, fails or is cancelled
    Watch {
        workflow_id: String,

        /// Prompt for confirmations, job selections and context access
        #[arg(short, long)]
        interactive: bool,
    },
    /// Stream the status messages of an agent session
    AgentStatus {
        session_id: String,

        /// Poll interval, clamped to 2000..=5000 ms
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

type StdinLines = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = ClientConfig::resolve(cli.config.as_deref())?;
    if let Some(url) = cli.api_url {
        config.api_url = url;
    }
    if let Some(token) = cli.api_token {
        config.api_token = Some(token);
    }
    config.validate()?;

    let events = event_sink(&config)?;
    let transport: Arc<dyn WorkflowTransport> = Arc::new(HttpTransport::new(&config)?);

    match cli.command {
        Command::Watch {
            workflow_id,
            interactive,
        } => watch(transport, &config, events, &workflow_id, interactive).await,
        Command::AgentStatus {
            session_id,
            interval_ms,
        } => agent_status(transport, &config, events, &session_id, interval_ms).await,
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("WFSYNC_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn event_sink(config: &ClientConfig) -> Result<EventSink> {
    if !config.event_log {
        return Ok(EventSink::default());
    }
    let session_id = uuid::Uuid::new_v4().to_string();
    let log = SyncEventLog::for_session(&session_id).context("Failed to open event log")?;
    tracing::info!(path = %log.log_path().display(), "writing sync events");
    Ok(EventSink::new(Some(Arc::new(log))))
}

async fn watch(
    transport: Arc<dyn WorkflowTransport>,
    config: &ClientConfig,
    events: EventSink,
    workflow_id: &str,
    interactive: bool,
) -> Result<()> {
    let engine = Arc::new(WorkflowSyncEngine::with_events(
        transport,
        config.sync.clone(),
        events,
    ));
    let hydrator = EmailHydrator::spawn(engine.transport(), engine.subscribe());
    let resolver = InteractionResolver::new(Arc::clone(&engine));
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut rx = engine.subscribe();
    engine.start(workflow_id)?;

    let mut last_line = String::new();
    let mut prompted: Option<String> = None;
    loop {
        let snapshot = rx.borrow_and_update().clone();

        let line = status_line(&snapshot);
        if line != last_line {
            println!("{}", line);
            last_line = line;
        }

        match snapshot.phase {
            SyncPhase::Settled => return finished(&snapshot),
            SyncPhase::Errored => {
                let message = snapshot.error_message().unwrap_or_default();
                anyhow::bail!("sync stopped: {}", message);
            }
            SyncPhase::Idle | SyncPhase::Syncing => {}
        }

        let key = interaction_key(&snapshot.interaction);
        if key != prompted {
            prompted = key;
            if interactive {
                let answered =
                    prompt(&resolver, &hydrator, &snapshot.interaction, &mut stdin).await?;
                if !answered {
                    // Ask again on the next snapshot.
                    prompted = None;
                }
            } else if let Some(hint) = describe(&snapshot.interaction) {
                println!("  waiting for: {}", hint);
            }
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                engine.stop();
                return Ok(());
            }
        }
    }
}

/// Completed workflows exit cleanly; failed and cancelled ones are errors.
fn finished(snapshot: &SyncSnapshot) -> Result<()> {
    let Some(workflow) = snapshot.workflow.as_deref() else {
        return Ok(());
    };
    match workflow.status {
        WorkflowStatus::Failed => {
            let reason = workflow
                .steps
                .iter()
                .find_map(|step| step.error_message.as_deref())
                .unwrap_or("no error message");
            anyhow::bail!("workflow {} failed: {}", workflow.id, reason)
        }
        WorkflowStatus::Cancelled => anyhow::bail!("workflow {} was cancelled", workflow.id),
        _ => Ok(()),
    }
}

fn status_line(snapshot: &SyncSnapshot) -> String {
    let Some(workflow) = snapshot.workflow.as_deref() else {
        return format!(
            "[{}] {} (no data yet)",
            phase_label(snapshot.phase),
            snapshot.workflow_id.as_deref().unwrap_or("-")
        );
    };
    let stalled = if snapshot.stalled { " (stalled)" } else { "" };
    format!(
        "[{}] {} {} {}{}",
        phase_label(snapshot.phase),
        workflow.id,
        workflow.status,
        step_label(workflow),
        stalled
    )
}

fn step_label(workflow: &Workflow) -> String {
    match workflow.current_step() {
        Some(step) => format!(
            "step {}/{}: {}",
            step.step_number,
            workflow.steps.len(),
            step.description
        ),
        None => format!("{} steps", workflow.steps.len()),
    }
}

fn phase_label(phase: SyncPhase) -> &'static str {
    match phase {
        SyncPhase::Idle => "idle",
        SyncPhase::Syncing => "syncing",
        SyncPhase::Settled => "settled",
        SyncPhase::Errored => "errored",
    }
}

fn interaction_key(interaction: &Interaction) -> Option<String> {
    interaction
        .step_id()
        .map(|step_id| format!("{:?}:{}", interaction.kind(), step_id))
}

fn describe(interaction: &Interaction) -> Option<String> {
    match interaction {
        Interaction::None => None,
        Interaction::NeedsUserContext { workflow_id, .. } => {
            Some(format!("context access for workflow {}", workflow_id))
        }
        Interaction::NeedsEmailConfirmation { step_id, .. } => {
            Some(format!("email confirmation on step {}", step_id))
        }
        Interaction::NeedsJobSelection {
            step_id,
            candidates,
            ..
        } => Some(format!(
            "job selection on step {} ({} candidates)",
            step_id,
            candidates.len()
        )),
    }
}

/// Asks the user to resolve `interaction`. Returns false when nothing was
/// submitted and the prompt should be repeated.
async fn prompt(
    resolver: &InteractionResolver,
    hydrator: &EmailHydrator,
    interaction: &Interaction,
    stdin: &mut StdinLines,
) -> Result<bool> {
    let result = match interaction {
        Interaction::None => return Ok(true),
        Interaction::NeedsUserContext { workflow_id, .. } => {
            if !ask_yes_no("The workflow needs access to your context. Grant it?", stdin).await? {
                println!("  Left waiting. The workflow stays paused until access is granted.");
                return Ok(true);
            }
            resolver.resolve_user_context_injection(workflow_id).await
        }
        Interaction::NeedsEmailConfirmation { step_id, .. } => {
            let accepted = confirm_email(hydrator, interaction, step_id, stdin).await?;
            resolver.resolve_confirmation(step_id, accepted).await
        }
        Interaction::NeedsJobSelection {
            step_id,
            candidates,
            ..
        } => {
            println!("Select a job:");
            for (index, candidate) in candidates.iter().enumerate() {
                match &candidate.summary {
                    Some(summary) => println!("  {}. {} - {}", index + 1, candidate.label, summary),
                    None => println!("  {}. {}", index + 1, candidate.label),
                }
            }
            let answer = read_line("Number or key: ", stdin).await?;
            let key = answer
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| candidates.get(i))
                .map(|c| c.key.clone())
                .unwrap_or(answer);
            resolver.resolve_job_selection(step_id, &key).await
        }
    };

    match result {
        Ok(Resolution::Submitted(_)) => {
            println!("  Submitted.");
            Ok(true)
        }
        Ok(Resolution::SubmittedWithoutResync(e)) => {
            println!("  Submitted; status will refresh later ({}).", e);
            Ok(true)
        }
        Ok(Resolution::AlreadyInFlight) => Ok(true),
        Err(ResolutionError::StaleInteraction { .. }) => {
            println!("  The workflow moved on; refreshing.");
            Ok(true)
        }
        Err(e) => {
            eprintln!("  {}", e);
            Ok(false)
        }
    }
}

async fn confirm_email(
    hydrator: &EmailHydrator,
    interaction: &Interaction,
    step_id: &str,
    stdin: &mut StdinLines,
) -> Result<bool> {
    let mut updates = hydrator.subscribe();
    let _ = tokio::time::timeout(
        PREVIEW_WAIT,
        updates.wait_for(|_| hydrator.email_for(interaction).is_some()),
    )
    .await;

    match hydrator.email_for(interaction) {
        Some(email) => {
            println!("To:      {}", email.to.join(", "));
            if !email.cc.is_empty() {
                println!("Cc:      {}", email.cc.join(", "));
            }
            println!("Subject: {}", email.subject);
            for attachment in &email.attachments {
                println!("Attach:  {}", attachment.filename);
            }
            println!("\n{}\n", email.body);
            if email.body_truncated {
                println!("(preview truncated, answer 'v' to view the full body)");
            }
        }
        None => {
            if let Some(EmailHydration::Failed(error)) = hydrator.details(step_id) {
                eprintln!("  Could not load the email preview: {}", error);
            }
            println!("(email preview unavailable)");
        }
    }

    loop {
        let answer = read_line("Send this email? [y/n/v] ", stdin).await?;
        match answer.to_ascii_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            "v" | "view" => match hydrator.full_body(step_id).await {
                Ok(body) => println!("\n{}\n", body),
                Err(e) => eprintln!("  Could not load the full body: {}", e),
            },
            _ => {}
        }
    }
}

async fn ask_yes_no(question: &str, stdin: &mut StdinLines) -> Result<bool> {
    let answer = read_line(&format!("{} [y/N] ", question), stdin).await?;
    Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
}

async fn read_line(prompt: &str, stdin: &mut StdinLines) -> Result<String> {
    use std::io::Write;
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let line = stdin
        .next_line()
        .await?
        .context("stdin closed while waiting for an answer")?;
    Ok(line.trim().to_string())
}

async fn agent_status(
    transport: Arc<dyn WorkflowTransport>,
    config: &ClientConfig,
    events: EventSink,
    session_id: &str,
    interval_ms: Option<u64>,
) -> Result<()> {
    let mut sync = config.sync.clone();
    if let Some(ms) = interval_ms {
        sync.agent_interval_ms = ms;
    }
    let stream = AgentStatusSync::with_events(transport, sync, events);
    let mut rx = stream.subscribe();
    stream.start(session_id)?;

    let mut printed = 0;
    let mut last_error: Option<String> = None;
    loop {
        let snapshot = rx.borrow_and_update().clone();
        for message in snapshot.messages.iter().skip(printed) {
            println!("[{}] {}", message.timestamp, message.message);
        }
        printed = snapshot.messages.len();

        if snapshot.error != last_error {
            if let Some(error) = &snapshot.error {
                eprintln!("  {}", error);
            }
            last_error = snapshot.error.clone();
        }

        match snapshot.phase {
            SyncPhase::Settled => {
                if let Some(result) = &snapshot.result {
                    println!("{}", serde_json::to_string_pretty(result)?);
                }
                return Ok(());
            }
            SyncPhase::Errored => {
                anyhow::bail!(
                    "agent status stopped: {}",
                    snapshot.error.unwrap_or_default()
                );
            }
            SyncPhase::Idle | SyncPhase::Syncing => {}
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                stream.stop();
                return Ok(());
            }
        }
    }
}
