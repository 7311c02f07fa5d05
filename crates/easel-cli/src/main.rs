use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use easel_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use easel_contracts::events::AuditLog;
use easel_contracts::history::{GenerationHistory, HistoryEntry};
use easel_contracts::ledger::{QuotaLedger, FREE_GENERATION_LIMIT, REFERRAL_REWARD};
use easel_contracts::models::{
    is_supported_aspect_ratio, is_supported_style, ModelCatalog, ASPECT_RATIOS,
    DEFAULT_ASPECT_RATIO, DEFAULT_MODEL, DEFAULT_PROVIDER, STYLE_PRESETS,
};
use easel_contracts::presets::{Preset, PresetStore};
use easel_contracts::session::{Session, SessionStore};
use easel_contracts::tasks::{perturb_prompt, ImageCategory, ImageTask, VARIATIONS_STRENGTH};
use easel_contracts::wizard::{InpaintStep, WizardInput, WizardOutcome, WizardState};
use easel_engine::{
    default_provider_registry, non_empty_env, prepare_manual_mask, DispatchError, FsObjectStore,
    GenerationPipeline, GenerationRequest, HandoffStart, HttpMaskRelay, MaskBroker,
    PromptTranslator, ProviderError, RelayError, Watermark,
};
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(name = "easel", version, about = "Chat-driven image generation agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat loop standing in for the messaging transport.
    Chat(ChatArgs),
    /// Deliver a single message and exit.
    Send(SendArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long, default_value = "easel-data")]
    data_dir: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    watermark: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    user: u64,
}

#[derive(Debug, Parser)]
struct SendArgs {
    #[arg(long, default_value = "easel-data")]
    data_dir: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    watermark: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    user: u64,
    #[arg(long)]
    message: String,
}

const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8077";
const DEFAULT_EDITOR_URL: &str = "http://127.0.0.1:8080/editor";

const PACKAGES: &[(&str, u64)] = &[
    ("small", 50),
    ("medium", 150),
    ("large", 500),
    ("unlimited", 9999),
];

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("easel error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => run_chat(args),
        Command::Send(args) => run_send(args),
    }
}

fn run_chat(args: ChatArgs) -> Result<i32> {
    let context = Arc::new(build_context(&args.data_dir, args.events, args.watermark)?);
    let stdin = io::stdin();
    let mut line = String::new();
    let mut current_user = args.user;
    let mut workers: Vec<thread::JoinHandle<()>> = Vec::new();

    println!(
        "Easel chat started as user {current_user}. \
         /help for commands, /as <id> to switch users, /quit to exit."
    );

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']).to_string();
        let trimmed = input.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "/quit" || trimmed == "/exit" {
            break;
        }
        if trimmed == "/as" || trimmed.starts_with("/as ") {
            let rest = trimmed.trim_start_matches("/as").trim();
            if rest.is_empty() {
                println!("Speaking as user {current_user}.");
            } else {
                match rest.parse::<u64>() {
                    Ok(id) => {
                        current_user = id;
                        println!("Now speaking as user {current_user}.");
                    }
                    Err(_) => println!("Usage: /as <numeric user id>"),
                }
            }
            continue;
        }

        // One thread per message; replies print as they land, like a bot
        // answering out of band. Per-user state stays consistent because
        // the session store serializes access per user id.
        let ctx = Arc::clone(&context);
        let user_id = current_user;
        workers.push(thread::spawn(move || {
            handle_message(&ctx, user_id, &input, &mut |text: String| {
                print_reply(user_id, &text)
            });
        }));
        workers.retain(|handle| !handle.is_finished());
    }

    for handle in workers {
        let _ = handle.join();
    }
    Ok(0)
}

fn run_send(args: SendArgs) -> Result<i32> {
    let context = build_context(&args.data_dir, args.events, args.watermark)?;
    let user_id = args.user;
    handle_message(&context, user_id, &args.message, &mut |text: String| {
        print_reply(user_id, &text)
    });
    Ok(0)
}

fn print_reply(user_id: u64, text: &str) {
    for line in text.lines() {
        println!("[{user_id}] {line}");
    }
}

struct ChatContext {
    sessions: Arc<SessionStore>,
    ledger: Arc<QuotaLedger>,
    history: Arc<GenerationHistory>,
    presets: Arc<PresetStore>,
    catalog: ModelCatalog,
    pipeline: Arc<GenerationPipeline>,
    broker: MaskBroker<HttpMaskRelay>,
    audit: AuditLog,
    masks_dir: PathBuf,
    admin_id: Option<u64>,
}

fn build_context(
    data_dir: &Path,
    events: Option<PathBuf>,
    watermark: Option<PathBuf>,
) -> Result<ChatContext> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed creating {}", data_dir.display()))?;
    let events_path = events.unwrap_or_else(|| data_dir.join("events.jsonl"));
    let audit = AuditLog::new(events_path, "easel");

    let sessions = Arc::new(SessionStore::new());
    let ledger = Arc::new(QuotaLedger::open(data_dir.join("limits.json"))?);
    let history = Arc::new(GenerationHistory::open(data_dir.join("history.json"))?);
    let presets = Arc::new(PresetStore::open(data_dir.join("presets.json"))?);
    let watermark = match watermark {
        Some(path) => Watermark::load(path),
        None => Watermark::disabled(),
    };

    let pipeline = Arc::new(GenerationPipeline {
        providers: default_provider_registry(),
        translator: PromptTranslator::new(),
        watermark,
        store: Box::new(FsObjectStore::new(data_dir.join("library"))),
        ledger: Arc::clone(&ledger),
        sessions: Arc::clone(&sessions),
        history: Arc::clone(&history),
        audit: audit.clone(),
        scratch_dir: data_dir.join("outbox"),
    });

    let relay_url =
        non_empty_env("EASEL_RELAY_URL").unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());
    let editor_url =
        non_empty_env("EASEL_EDITOR_URL").unwrap_or_else(|| DEFAULT_EDITOR_URL.to_string());
    let broker = MaskBroker::new(HttpMaskRelay::new(&relay_url), &editor_url);
    let admin_id = non_empty_env("EASEL_ADMIN_ID").and_then(|value| value.parse().ok());

    Ok(ChatContext {
        sessions,
        ledger,
        history,
        presets,
        catalog: ModelCatalog::new(),
        pipeline,
        broker,
        audit,
        masks_dir: data_dir.join("masks"),
        admin_id,
    })
}

fn handle_message(
    ctx: &ChatContext,
    user_id: u64,
    input: &str,
    reply: &mut dyn FnMut(String),
) {
    let intent = parse_intent(input);
    if intent.action == "noop" {
        return;
    }
    let action = intent.action.clone();

    let mut payload = Map::new();
    payload.insert("user_id".to_string(), json!(user_id));
    payload.insert("action".to_string(), json!(action));
    ctx.audit.record("chat_action", payload);

    let result = match action.as_str() {
        "start" => handle_start(ctx, user_id, &intent, reply),
        "reset" => {
            ctx.sessions.reset(user_id);
            reply("Fresh start. Send a prompt, or add reference photos with /photo <path>.".to_string());
            Ok(())
        }
        "help" => {
            reply(format!("Commands: {}", CHAT_HELP_COMMANDS.join(" ")));
            Ok(())
        }
        "update_settings" => handle_settings(ctx, user_id, &intent, reply),
        "start_wizard" => handle_start_wizard(ctx, user_id, &intent, reply),
        "cancel_wizard" => {
            let cancelled = ctx
                .sessions
                .with(user_id, |session| session.wizard.take().map(|w| w.kind()));
            match cancelled {
                Some(kind) => reply(format!("{} wizard cancelled.", wizard_label(kind))),
                None => reply("No active wizard.".to_string()),
            }
            Ok(())
        }
        "add_photos" => handle_photos(ctx, user_id, &intent, reply),
        "edit_image" => handle_editmy(ctx, user_id, &intent, reply),
        "generate" => {
            let text = intent.prompt.clone().unwrap_or_default();
            handle_generate(ctx, user_id, &text, reply)
        }
        "reload" => handle_reload(ctx, user_id, false, reply),
        "more_like_this" => handle_reload(ctx, user_id, true, reply),
        "upscale" | "remove_background" | "variations" => {
            handle_edit_op(ctx, user_id, action.as_str(), reply)
        }
        "poll_mask" => handle_poll_mask(ctx, user_id, reply),
        "push_mask" => handle_push_mask(ctx, user_id, &intent, reply),
        "profile" => handle_profile(ctx, user_id, reply),
        "buy" => handle_buy(ctx, user_id, reply),
        "preset" => handle_preset(ctx, user_id, &intent, reply),
        "show_library" => handle_library(ctx, user_id, &intent, reply),
        "toggle_favorite" => handle_favorite(ctx, user_id, &intent, reply),
        "admin_add" => handle_admin_add(ctx, user_id, &intent, reply),
        "admin_users" => handle_admin_users(ctx, user_id, reply),
        "unknown" => {
            let command = string_arg(&intent, "command").unwrap_or_default();
            reply(format!(
                "Unknown command '/{command}'. Type /help for the command list."
            ));
            Ok(())
        }
        other => {
            reply(format!("Unsupported action '{other}'."));
            Ok(())
        }
    };

    if let Err(err) = result {
        let mut payload = Map::new();
        payload.insert("user_id".to_string(), json!(user_id));
        payload.insert("action".to_string(), json!(action));
        payload.insert("error".to_string(), json!(format!("{err:#}")));
        ctx.audit.record("command_failed", payload);
        reply(format!("Something went wrong: {err:#}"));
    }
}

fn handle_start(
    ctx: &ChatContext,
    user_id: u64,
    intent: &Intent,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    // A bad or self-referential payload is ignored silently; the welcome
    // text still goes out.
    if let Some(referrer) = intent.command_args.get("referral").and_then(Value::as_u64) {
        if ctx.ledger.register_referral(user_id, referrer)? {
            reply(format!(
                "Referral registered. When you make your first image, \
                 user {referrer} earns +{REFERRAL_REWARD} generations."
            ));
        }
    }
    reply("Welcome to Easel. Send plain text and I will generate an image from it.".to_string());
    reply(
        "Wizards: /styletransfer /styleguide /sketch /inpaint. \
         Settings: /engine /model /format /style /negative."
            .to_string(),
    );
    reply("Add reference photos with /photo <path>; edit an existing file with /editmy <path>.".to_string());
    reply(format!(
        "You start with {FREE_GENERATION_LIMIT} free generations. Friends who join with \
         your code earn you +{REFERRAL_REWARD} each (see /profile)."
    ));
    reply("Type /help for the full command list.".to_string());
    Ok(())
}

fn handle_settings(
    ctx: &ChatContext,
    user_id: u64,
    intent: &Intent,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    let field = string_arg(intent, "field").unwrap_or_default();
    match intent.settings_update.get(field.as_str()).cloned() {
        None => show_setting(ctx, user_id, &field, reply),
        Some(Value::Null) => clear_setting(ctx, user_id, &field, reply),
        Some(Value::String(value)) => set_setting(ctx, user_id, &field, &value, reply),
        Some(_) => reply("Unsupported value.".to_string()),
    }
    Ok(())
}

fn show_setting(ctx: &ChatContext, user_id: u64, field: &str, reply: &mut dyn FnMut(String)) {
    let snapshot = ctx.sessions.snapshot(user_id);
    match field {
        "provider" => {
            let current = snapshot.provider.as_deref().unwrap_or(DEFAULT_PROVIDER);
            reply(format!(
                "Engine: {current}. Options: {}. Reset with /engine -.",
                ctx.catalog.providers().join(", ")
            ));
        }
        "model" => {
            let provider = snapshot.provider.as_deref().unwrap_or(DEFAULT_PROVIDER);
            let current = resolve_model(&ctx.catalog, provider, snapshot.model.as_deref());
            let known: Vec<String> = ctx
                .catalog
                .list()
                .map(|spec| format!("{} ({})", spec.name, spec.provider))
                .collect();
            reply(format!("Model: {current}. Known: {}.", known.join(", ")));
        }
        "format" => reply(format!(
            "Format: {}. Options: {}.",
            snapshot.format.as_deref().unwrap_or(DEFAULT_ASPECT_RATIO),
            ASPECT_RATIOS.join(", ")
        )),
        "style" => reply(format!(
            "Style: {}. Options: {}.",
            snapshot.style.as_deref().unwrap_or("none"),
            STYLE_PRESETS.join(", ")
        )),
        "negative_prompt" => reply(format!(
            "Negative prompt: {}. Set with /negative <text>, clear with /negative -.",
            snapshot.negative_prompt.as_deref().unwrap_or("(none)")
        )),
        other => reply(format!("Unknown setting '{other}'.")),
    }
}

fn clear_setting(ctx: &ChatContext, user_id: u64, field: &str, reply: &mut dyn FnMut(String)) {
    match field {
        "provider" => {
            ctx.sessions.with(user_id, |session| {
                session.provider = None;
                session.model = None;
            });
            reply(format!("Engine reset to default ({DEFAULT_PROVIDER})."));
        }
        "model" => {
            ctx.sessions.with(user_id, |session| session.model = None);
            reply("Model reset to the engine default.".to_string());
        }
        "format" => {
            ctx.sessions.with(user_id, |session| session.format = None);
            reply(format!("Format reset to default ({DEFAULT_ASPECT_RATIO})."));
        }
        "style" => {
            ctx.sessions.with(user_id, |session| session.style = None);
            reply("Style cleared.".to_string());
        }
        "negative_prompt" => {
            ctx.sessions
                .with(user_id, |session| session.negative_prompt = None);
            reply("Negative prompt cleared.".to_string());
        }
        other => reply(format!("Unknown setting '{other}'.")),
    }
}

fn set_setting(
    ctx: &ChatContext,
    user_id: u64,
    field: &str,
    value: &str,
    reply: &mut dyn FnMut(String),
) {
    match field {
        "provider" => {
            let providers = ctx.catalog.providers();
            if !providers.iter().any(|name| name == value) {
                reply(format!(
                    "Unknown engine '{value}'. Options: {}.",
                    providers.join(", ")
                ));
                return;
            }
            let default_model = ctx
                .catalog
                .default_model_for(value)
                .map(|spec| spec.name.clone())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string());
            ctx.sessions.with(user_id, |session| {
                session.provider = Some(value.to_string());
                session.model = None;
            });
            reply(format!(
                "Engine set to {value}; model defaults to {default_model}."
            ));
        }
        "model" => {
            let Some(spec) = ctx.catalog.get(value) else {
                let known: Vec<String> =
                    ctx.catalog.list().map(|spec| spec.name.clone()).collect();
                reply(format!(
                    "Unknown model '{value}'. Known models: {}.",
                    known.join(", ")
                ));
                return;
            };
            let provider = spec.provider.clone();
            ctx.sessions.with(user_id, |session| {
                session.model = Some(value.to_string());
                session.provider = Some(provider);
            });
            reply(format!("Model set to {value} (engine {}).", spec.provider));
        }
        "format" => {
            if !is_supported_aspect_ratio(value) {
                reply(format!(
                    "Unsupported aspect ratio '{value}'. Options: {}.",
                    ASPECT_RATIOS.join(", ")
                ));
                return;
            }
            ctx.sessions
                .with(user_id, |session| session.format = Some(value.to_string()));
            reply(format!("Format set to {value}."));
        }
        "style" => {
            if !is_supported_style(value) {
                reply(format!(
                    "Unknown style '{value}'. Options: {}.",
                    STYLE_PRESETS.join(", ")
                ));
                return;
            }
            ctx.sessions
                .with(user_id, |session| session.style = Some(value.to_string()));
            reply(format!("Style set to {value}."));
        }
        "negative_prompt" => {
            ctx.sessions.with(user_id, |session| {
                session.negative_prompt = Some(value.to_string())
            });
            reply("Negative prompt saved.".to_string());
        }
        other => reply(format!("Unknown setting '{other}'.")),
    }
}

fn handle_start_wizard(
    ctx: &ChatContext,
    user_id: u64,
    intent: &Intent,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    let kind = string_arg(intent, "wizard").unwrap_or_default();
    let active = ctx
        .sessions
        .with(user_id, |session| session.wizard.as_ref().map(|w| w.kind()));
    if let Some(active) = active {
        reply(format!(
            "A {} wizard is already running. Finish it or /cancel first.",
            wizard_label(active)
        ));
        return Ok(());
    }

    match kind.as_str() {
        "styletransfer" => install_wizard(ctx, user_id, WizardState::style_transfer(), reply),
        "styleguide" => install_wizard(ctx, user_id, WizardState::style_guide(), reply),
        "sketch" => install_wizard(ctx, user_id, WizardState::sketch(), reply),
        "inpaint" => start_inpaint(ctx, user_id, reply),
        other => reply(format!("Unknown wizard '{other}'.")),
    }
    Ok(())
}

fn install_wizard(
    ctx: &ChatContext,
    user_id: u64,
    state: WizardState,
    reply: &mut dyn FnMut(String),
) {
    let ask = state.ask();
    ctx.sessions
        .with(user_id, |session| session.wizard = Some(state));
    reply(ask);
}

fn start_inpaint(ctx: &ChatContext, user_id: u64, reply: &mut dyn FnMut(String)) {
    let snapshot = ctx.sessions.snapshot(user_id);
    let Some(source) = edit_target(&snapshot) else {
        reply(
            "Nothing to inpaint yet. Generate an image first, or load one with /editmy <path>."
                .to_string(),
        );
        return;
    };

    // Probe the relay before promising the editor round trip.
    let handoff = ctx.broker.begin_handoff(user_id);
    let state = WizardState::inpaint(source);
    ctx.sessions
        .with(user_id, |session| session.wizard = Some(state));

    match handoff {
        HandoffStart::Editor { url } => {
            reply(format!("Open the mask editor: {url}"));
            reply(
                "Finish the mask there and send /done, or send your own mask with \
                 /photo <path> (white = repaint, black = keep)."
                    .to_string(),
            );
        }
        HandoffStart::ManualFallback => {
            reply("The mask editor is not reachable right now.".to_string());
            reply(
                "Paint the mask yourself (white = repaint, black = keep) and send it \
                 with /photo <path>."
                    .to_string(),
            );
        }
    }
}

fn handle_photos(
    ctx: &ChatContext,
    user_id: u64,
    intent: &Intent,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    let raw_paths = path_args(intent, "paths");
    if raw_paths.is_empty() {
        reply("Attach images with /photo <path> [more paths].".to_string());
        return Ok(());
    }

    let mut valid: Vec<PathBuf> = Vec::new();
    for raw in raw_paths {
        let path = PathBuf::from(&raw);
        if image::image_dimensions(&path).is_ok() {
            valid.push(path);
        } else {
            reply(format!("Cannot read {raw} as an image; skipped."));
        }
    }
    if valid.is_empty() {
        return Ok(());
    }

    let snapshot = ctx.sessions.snapshot(user_id);
    match &snapshot.wizard {
        Some(WizardState::Inpaint(wizard)) if wizard.step == InpaintStep::MaskWait => {
            match prepare_manual_mask(&valid[0], &wizard.image, &ctx.masks_dir) {
                Ok(mask) => advance_wizard(ctx, user_id, WizardInput::Image(mask), reply),
                Err(err) => {
                    reply(format!("Could not use that mask: {err:#}"));
                    Ok(())
                }
            }
        }
        Some(_) => {
            if valid.len() > 1 {
                reply(format!(
                    "One image per step; using {} and ignoring {} more.",
                    valid[0].display(),
                    valid.len() - 1
                ));
            }
            advance_wizard(ctx, user_id, WizardInput::Image(valid[0].clone()), reply)
        }
        None => {
            for path in &valid {
                match fs::read(path) {
                    Ok(bytes) => {
                        if let Err(err) =
                            ctx.pipeline.store.put(user_id, ImageCategory::Uploaded, &bytes)
                        {
                            eprintln!("easel: library save failed: {err:#}");
                        }
                    }
                    Err(err) => eprintln!("easel: could not read {}: {err}", path.display()),
                }
            }
            let count = valid.len();
            ctx.sessions.with(user_id, |session| {
                session.reference_images.extend(valid);
            });
            reply(format!(
                "Added {count} reference image(s). The next prompt will transform the first one."
            ));
            Ok(())
        }
    }
}

fn handle_editmy(
    ctx: &ChatContext,
    user_id: u64,
    intent: &Intent,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    let Some(raw) = string_arg(intent, "path") else {
        reply(
            "Load an image to edit: /editmy <path>. Then /upscale, /removebg, /variations \
             or /inpaint."
                .to_string(),
        );
        return Ok(());
    };
    let path = PathBuf::from(&raw);
    if image::image_dimensions(&path).is_err() {
        reply(format!("Cannot read {raw} as an image."));
        return Ok(());
    }

    // Loading an edit source starts a clean project, like /new.
    ctx.sessions.reset(user_id);
    match fs::read(&path) {
        Ok(bytes) => {
            if let Err(err) = ctx.pipeline.store.put(user_id, ImageCategory::Uploaded, &bytes) {
                eprintln!("easel: library save failed: {err:#}");
            }
        }
        Err(err) => eprintln!("easel: could not read {}: {err}", path.display()),
    }
    ctx.sessions
        .with(user_id, |session| session.edit_source = Some(path));
    reply("Image loaded. Pick an operation: /upscale, /removebg, /variations or /inpaint.".to_string());
    Ok(())
}

fn handle_generate(
    ctx: &ChatContext,
    user_id: u64,
    text: &str,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    let snapshot = ctx.sessions.snapshot(user_id);
    if snapshot.wizard.is_some() {
        return advance_wizard(ctx, user_id, WizardInput::Text(text.to_string()), reply);
    }

    let (request, arms_refinement) = if snapshot.in_refinement_mode {
        let Some(saved) = snapshot.saved_params.clone() else {
            reply("No saved parameters to refine. Send /new and start from a fresh prompt.".to_string());
            return Ok(());
        };
        let request = GenerationRequest {
            provider: saved.provider.clone(),
            model: saved.model.clone(),
            task: ImageTask::TextToImage {
                prompt: text.to_string(),
                negative_prompt: snapshot.negative_prompt.clone(),
                aspect_ratio: saved.format.clone(),
                style_preset: saved.style.clone(),
            },
        };
        (request, true)
    } else if let Some(reference) = snapshot.reference_images.first() {
        let (provider, model) = backend_for_edits(&ctx.catalog, &snapshot);
        let model = ensure_image_to_image(&ctx.catalog, &provider, model);
        let request = GenerationRequest {
            provider,
            model,
            task: ImageTask::Variations {
                image: reference.clone(),
                prompt: Some(text.to_string()),
                strength: VARIATIONS_STRENGTH,
            },
        };
        (request, false)
    } else {
        let provider = snapshot
            .provider
            .clone()
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
        let model = resolve_model(&ctx.catalog, &provider, snapshot.model.as_deref());
        let request = GenerationRequest {
            provider,
            model,
            task: ImageTask::TextToImage {
                prompt: text.to_string(),
                negative_prompt: snapshot.negative_prompt.clone(),
                aspect_ratio: snapshot
                    .format
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ASPECT_RATIO.to_string()),
                style_preset: snapshot.style.clone(),
            },
        };
        (request, true)
    };

    reply(format!(
        "Generating with {}/{}...",
        request.provider, request.model
    ));
    if run_generation(ctx, user_id, snapshot.epoch, &request, reply) {
        let prompt = text.to_string();
        ctx.sessions
            .apply_if_current(user_id, snapshot.epoch, |session| {
                session.prompt = prompt;
                if arms_refinement {
                    session.in_refinement_mode = true;
                }
            });
        reply(
            "Send a refined prompt to iterate, or use /reload /more /upscale /variations \
             /removebg /inpaint."
                .to_string(),
        );
    }
    Ok(())
}

fn handle_reload(
    ctx: &ChatContext,
    user_id: u64,
    perturb: bool,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    let snapshot = ctx.sessions.snapshot(user_id);
    let Some(saved) = snapshot.saved_params.clone() else {
        reply("Nothing to rerun yet. Generate an image first.".to_string());
        return Ok(());
    };
    let prompt = if perturb {
        perturb_prompt(&saved.prompt)
    } else {
        saved.prompt.clone()
    };
    let request = GenerationRequest {
        provider: saved.provider.clone(),
        model: saved.model.clone(),
        task: ImageTask::TextToImage {
            prompt,
            negative_prompt: saved.negative_prompt.clone(),
            aspect_ratio: saved.format.clone(),
            style_preset: saved.style.clone(),
        },
    };

    reply(format!(
        "Generating with {}/{}...",
        request.provider, request.model
    ));
    if run_generation(ctx, user_id, snapshot.epoch, &request, reply) && perturb {
        // Keep the unperturbed prompt in the snapshot so repeated /more
        // varies the original instead of stacking suffixes.
        let original = saved.prompt;
        ctx.sessions
            .apply_if_current(user_id, snapshot.epoch, |session| {
                if let Some(params) = session.saved_params.as_mut() {
                    params.prompt = original;
                }
            });
    }
    Ok(())
}

fn handle_edit_op(
    ctx: &ChatContext,
    user_id: u64,
    action: &str,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    let snapshot = ctx.sessions.snapshot(user_id);
    let Some(source) = edit_target(&snapshot) else {
        reply(
            "Nothing to edit yet. Generate an image first, or load one with /editmy <path>."
                .to_string(),
        );
        return Ok(());
    };

    let task = match action {
        "upscale" => ImageTask::Upscale { image: source },
        "remove_background" => ImageTask::RemoveBackground { image: source },
        _ => ImageTask::Variations {
            image: source,
            prompt: None,
            strength: VARIATIONS_STRENGTH,
        },
    };
    let (provider, model) = backend_for_edits(&ctx.catalog, &snapshot);
    let model = if matches!(task, ImageTask::Variations { .. }) {
        ensure_image_to_image(&ctx.catalog, &provider, model)
    } else {
        model
    };
    let request = GenerationRequest {
        provider,
        model,
        task,
    };

    reply(format!(
        "Running {} with {}/{}...",
        action.replace('_', " "),
        request.provider,
        request.model
    ));
    run_generation(ctx, user_id, snapshot.epoch, &request, reply);
    Ok(())
}

fn handle_poll_mask(
    ctx: &ChatContext,
    user_id: u64,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    match inpaint_gate(ctx, user_id) {
        InpaintGate::Inactive => {
            reply("No mask hand-off is waiting. Start one with /inpaint.".to_string());
            return Ok(());
        }
        InpaintGate::AwaitingPrompt => {
            reply("The mask is already in. Describe what to paint.".to_string());
            return Ok(());
        }
        InpaintGate::AwaitingMask => {}
    }

    match ctx.broker.resolve_pending(user_id, &ctx.masks_dir) {
        Ok(mask_path) => advance_wizard(ctx, user_id, WizardInput::Image(mask_path), reply),
        Err(RelayError::NoPending) => {
            reply("The mask has not arrived yet. Finish it in the editor, then send /done again.".to_string());
            Ok(())
        }
        Err(RelayError::NotFound) => {
            reply("The mask expired or was already claimed. Restart with /inpaint.".to_string());
            Ok(())
        }
        Err(RelayError::Unreachable(reason)) => {
            reply(format!(
                "The mask relay is unreachable ({reason}). Send the mask image yourself \
                 with /photo <path>."
            ));
            Ok(())
        }
        Err(err) => {
            reply(format!("Mask retrieval failed: {err}"));
            Ok(())
        }
    }
}

fn handle_push_mask(
    ctx: &ChatContext,
    user_id: u64,
    intent: &Intent,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    let Some(mask_id) = string_arg(intent, "mask_id") else {
        reply("Usage: /maskid <id> (shown by the mask editor).".to_string());
        return Ok(());
    };
    match inpaint_gate(ctx, user_id) {
        InpaintGate::Inactive => {
            reply("No inpaint is running. Start one with /inpaint.".to_string());
            return Ok(());
        }
        InpaintGate::AwaitingPrompt => {
            reply("The mask is already in. Describe what to paint.".to_string());
            return Ok(());
        }
        InpaintGate::AwaitingMask => {}
    }

    match ctx.broker.fetch_by_id(&mask_id, &ctx.masks_dir) {
        Ok(mask_path) => advance_wizard(ctx, user_id, WizardInput::Image(mask_path), reply),
        Err(RelayError::NotFound) => {
            reply("That mask id is unknown, expired or already used.".to_string());
            Ok(())
        }
        Err(RelayError::Unreachable(reason)) => {
            reply(format!(
                "The mask relay is unreachable ({reason}). Send the mask image with \
                 /photo <path> instead."
            ));
            Ok(())
        }
        Err(err) => {
            reply(format!("Mask retrieval failed: {err}"));
            Ok(())
        }
    }
}

fn handle_profile(ctx: &ChatContext, user_id: u64, reply: &mut dyn FnMut(String)) -> Result<()> {
    let status = ctx.ledger.can_generate(user_id)?;
    let record = ctx.ledger.record(user_id)?;
    let stats = ctx.ledger.referral_stats(user_id)?;
    let snapshot = ctx.sessions.snapshot(user_id);

    reply(format!("User {user_id}"));
    reply(format!(
        "Generations: {} used of {FREE_GENERATION_LIMIT}, {} remaining.",
        status.used, status.remaining
    ));
    if let Some(first) = &record.first_generation_at {
        reply(format!("First generation: {first}"));
    }
    reply(format!(
        "Referrals: {} invited, {} generated, +{} generations earned.",
        stats.referrals_count, stats.referrals_with_generations, stats.earned
    ));
    reply(format!(
        "Your referral code is {user_id}; a friend joins with: /start {user_id}"
    ));
    if !snapshot.prompt.is_empty() {
        reply(format!("Current prompt: {}", preview(&snapshot.prompt, 50)));
    }
    Ok(())
}

fn handle_buy(ctx: &ChatContext, user_id: u64, reply: &mut dyn FnMut(String)) -> Result<()> {
    let status = ctx.ledger.can_generate(user_id)?;
    reply(format!("Balance: {} generations.", status.remaining));
    reply("Packages:".to_string());
    for (name, count) in PACKAGES {
        reply(format!("  {name}: {count} generations"));
    }
    reply(
        "Purchases go through support; an admin applies them with /admin_add <user> <count>."
            .to_string(),
    );
    Ok(())
}

fn handle_preset(
    ctx: &ChatContext,
    user_id: u64,
    intent: &Intent,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    let subcommand = string_arg(intent, "subcommand").unwrap_or_else(|| "list".to_string());
    let name = string_arg(intent, "name");
    let target = string_arg(intent, "target");

    match subcommand.as_str() {
        "list" => {
            let presets = ctx.presets.list(user_id)?;
            if presets.is_empty() {
                reply("No presets saved. Save one with /preset save <name>.".to_string());
            }
            for (name, preset) in presets {
                reply(format!("  {name}: {}", describe_preset(&preset)));
            }
        }
        "save" => {
            let Some(name) = name else {
                reply("Usage: /preset save <name>".to_string());
                return Ok(());
            };
            let snapshot = ctx.sessions.snapshot(user_id);
            let preset = Preset {
                model: snapshot.model.clone(),
                format: snapshot.format.clone(),
                style: snapshot.style.clone(),
                negative_prompt: snapshot.negative_prompt.clone(),
                created: String::new(),
            };
            if ctx.presets.save(user_id, &name, preset)? {
                reply(format!("Preset '{name}' saved."));
            } else {
                reply(format!(
                    "Preset '{name}' already exists. Delete or rename it first."
                ));
            }
        }
        "use" => {
            let Some(name) = name else {
                reply("Usage: /preset use <name>".to_string());
                return Ok(());
            };
            match ctx.presets.get(user_id, &name)? {
                None => reply(format!("No preset named '{name}'.")),
                Some(preset) => {
                    let provider = preset
                        .model
                        .as_deref()
                        .and_then(|model| ctx.catalog.get(model))
                        .map(|spec| spec.provider.clone());
                    ctx.sessions.with(user_id, |session| {
                        session.model = preset.model.clone();
                        session.format = preset.format.clone();
                        session.style = preset.style.clone();
                        session.negative_prompt = preset.negative_prompt.clone();
                        if let Some(provider) = provider {
                            session.provider = Some(provider);
                        }
                    });
                    reply(format!("Preset '{name}' applied."));
                }
            }
        }
        "delete" => {
            let Some(name) = name else {
                reply("Usage: /preset delete <name>".to_string());
                return Ok(());
            };
            if ctx.presets.delete(user_id, &name)? {
                reply(format!("Preset '{name}' deleted."));
            } else {
                reply(format!("No preset named '{name}'."));
            }
        }
        "rename" => {
            let (Some(from), Some(to)) = (name, target) else {
                reply("Usage: /preset rename <old> <new>".to_string());
                return Ok(());
            };
            if ctx.presets.rename(user_id, &from, &to)? {
                reply(format!("Preset '{from}' renamed to '{to}'."));
            } else {
                reply("Rename failed: the source is missing or the target name is taken.".to_string());
            }
        }
        other => reply(format!(
            "Unknown preset action '{other}'. Use save, use, list, delete or rename."
        )),
    }
    Ok(())
}

fn handle_library(
    ctx: &ChatContext,
    user_id: u64,
    intent: &Intent,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    let filter = string_arg(intent, "filter").unwrap_or_default();
    match filter.as_str() {
        "" => {
            let generated = ctx.pipeline.store.list(user_id, ImageCategory::Generated)?.len();
            let uploaded = ctx.pipeline.store.list(user_id, ImageCategory::Uploaded)?.len();
            let edited = ctx.pipeline.store.list(user_id, ImageCategory::Edited)?.len();
            let entries = ctx.history.count(user_id)?;
            let favorites = ctx.history.favorites(user_id)?.len();
            reply(format!(
                "Library: {generated} generated, {uploaded} uploaded, {edited} edited."
            ));
            reply(format!("History: {entries} entries, {favorites} favorites."));
            reply("Use /lib generated|uploaded|edited|history|favorites for details.".to_string());
        }
        "generated" | "uploaded" | "edited" => {
            let category = match filter.as_str() {
                "generated" => ImageCategory::Generated,
                "uploaded" => ImageCategory::Uploaded,
                _ => ImageCategory::Edited,
            };
            let paths = ctx.pipeline.store.list(user_id, category)?;
            if paths.is_empty() {
                reply(format!("No {filter} images yet."));
            }
            for path in paths.iter().rev().take(10) {
                reply(format!("  {}", path.display()));
            }
        }
        "history" => {
            let rows = ctx.history.list(user_id, 10)?;
            if rows.is_empty() {
                reply("No generations recorded yet.".to_string());
            } else {
                for row in &rows {
                    reply(format_history_row(row));
                }
                reply("Toggle a favorite with /fav <id>.".to_string());
            }
        }
        "favorites" => {
            let rows = ctx.history.favorites(user_id)?;
            if rows.is_empty() {
                reply("No favorites yet. Mark one with /fav <id> (ids via /lib history).".to_string());
            }
            for row in &rows {
                reply(format_history_row(row));
            }
        }
        other => reply(format!(
            "Unknown filter '{other}'. Use generated, uploaded, edited, history or favorites."
        )),
    }
    Ok(())
}

fn handle_favorite(
    ctx: &ChatContext,
    user_id: u64,
    intent: &Intent,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    let Some(entry) = string_arg(intent, "entry") else {
        reply("Usage: /fav <entry-id> (ids via /lib history).".to_string());
        return Ok(());
    };
    match ctx.history.toggle_favorite(user_id, &entry)? {
        Some(true) => reply("Marked as favorite.".to_string()),
        Some(false) => reply("Favorite removed.".to_string()),
        None => reply(format!("No history entry '{entry}'.")),
    }
    Ok(())
}

fn handle_admin_add(
    ctx: &ChatContext,
    user_id: u64,
    intent: &Intent,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    if !is_admin(ctx, user_id) {
        reply("You are not allowed to use this command.".to_string());
        return Ok(());
    }
    let target = intent.command_args.get("user_id").and_then(Value::as_u64);
    let count = intent.command_args.get("count").and_then(Value::as_u64);
    let (Some(target), Some(count)) = (target, count) else {
        reply("Usage: /admin_add <user-id> <count>".to_string());
        return Ok(());
    };
    if count == 0 {
        reply("The amount must be positive.".to_string());
        return Ok(());
    }
    let status = ctx.ledger.add_generations(target, count)?;
    reply(format!(
        "Granted {count} generations to user {target}; they now have {} remaining.",
        status.remaining
    ));
    Ok(())
}

fn handle_admin_users(
    ctx: &ChatContext,
    user_id: u64,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    if !is_admin(ctx, user_id) {
        reply("You are not allowed to use this command.".to_string());
        return Ok(());
    }
    let users = ctx.ledger.all_users()?;
    if users.is_empty() {
        reply("No users in the ledger yet.".to_string());
        return Ok(());
    }
    for (id, record) in users {
        let first = record
            .first_generation_at
            .clone()
            .unwrap_or_else(|| "never".to_string());
        reply(format!(
            "{id}: used {}, remaining {}, referrals {}, first generation {first}",
            record.used,
            record.remaining(),
            record.referrals.len()
        ));
    }
    Ok(())
}

fn advance_wizard(
    ctx: &ChatContext,
    user_id: u64,
    input: WizardInput,
    reply: &mut dyn FnMut(String),
) -> Result<()> {
    let outcome = ctx.sessions.with(user_id, |session| {
        let wizard = session.wizard.as_mut()?;
        let outcome = wizard.advance(input);
        // Cleanup is unconditional once the terminal step is reached; a
        // failed dispatch must not leave a finished wizard behind.
        if matches!(outcome, WizardOutcome::Complete(_)) {
            session.wizard = None;
        }
        Some(outcome)
    });

    match outcome {
        None => {
            reply(
                "No wizard is active. Start one with /styletransfer, /styleguide, /sketch \
                 or /inpaint."
                    .to_string(),
            );
        }
        Some(WizardOutcome::Prompt { ask }) => reply(ask),
        Some(WizardOutcome::Rejected { error, ask }) => {
            reply(error);
            reply(ask);
        }
        Some(WizardOutcome::Complete(task)) => {
            let snapshot = ctx.sessions.snapshot(user_id);
            let (provider, model) = backend_for_edits(&ctx.catalog, &snapshot);
            let request = GenerationRequest {
                provider,
                model,
                task,
            };
            reply(format!(
                "Generating with {}/{}...",
                request.provider, request.model
            ));
            run_generation(ctx, user_id, snapshot.epoch, &request, reply);
        }
    }
    Ok(())
}

/// Shared tail of every generation: dispatch, then translate the outcome
/// into chat replies. Returns whether the image was produced.
fn run_generation(
    ctx: &ChatContext,
    user_id: u64,
    epoch: u64,
    request: &GenerationRequest,
    reply: &mut dyn FnMut(String),
) -> bool {
    match ctx.pipeline.dispatch(user_id, epoch, request) {
        Ok(outcome) => {
            reply(format!("Image ready: {}", outcome.image_path.display()));
            if let Some(stored) = &outcome.stored {
                reply(format!("Saved to your library as {}", stored.locator));
            }
            if let Some(reason) = &outcome.persist_error {
                reply(format!("Library save failed: {reason}"));
            }
            match outcome.remaining {
                Some(remaining) => reply(format!("{remaining} free generations left.")),
                None => reply("No free generations left.".to_string()),
            }
            if let Some(referrer) = outcome.rewarded_referrer {
                reply(format!(
                    "Your first image earned user {referrer} +{REFERRAL_REWARD} generations."
                ));
            }
            true
        }
        Err(err) => {
            reply(describe_dispatch_error(&err));
            false
        }
    }
}

fn describe_dispatch_error(err: &DispatchError) -> String {
    match err {
        DispatchError::QuotaExceeded { used } => format!(
            "You have used all {used} free generations. Invite friends (/profile) or ask \
             an admin for a top-up (/buy)."
        ),
        DispatchError::Provider(ProviderError::ContentFiltered) => {
            "The provider's content filter rejected this request. Rephrase and try again."
                .to_string()
        }
        DispatchError::Provider(ProviderError::MissingCredentials { env_var, .. }) => format!(
            "Provider credentials missing: set {env_var}, or switch to /engine dryrun for \
             offline runs."
        ),
        other => format!("Generation failed: {other}"),
    }
}

enum InpaintGate {
    AwaitingMask,
    AwaitingPrompt,
    Inactive,
}

fn inpaint_gate(ctx: &ChatContext, user_id: u64) -> InpaintGate {
    ctx.sessions.with(user_id, |session| match &session.wizard {
        Some(WizardState::Inpaint(wizard)) => {
            if wizard.step == InpaintStep::MaskWait {
                InpaintGate::AwaitingMask
            } else {
                InpaintGate::AwaitingPrompt
            }
        }
        _ => InpaintGate::Inactive,
    })
}

fn is_admin(ctx: &ChatContext, user_id: u64) -> bool {
    ctx.admin_id == Some(user_id)
}

/// The newest result wins; an explicitly loaded file only matters until
/// the first edit produces something newer.
fn edit_target(session: &Session) -> Option<PathBuf> {
    session
        .last_image
        .clone()
        .or_else(|| session.edit_source.clone())
}

fn resolve_model(catalog: &ModelCatalog, provider: &str, chosen: Option<&str>) -> String {
    if let Some(name) = chosen {
        if let Some(spec) = catalog.get(name) {
            if spec.provider == provider {
                return spec.name.clone();
            }
        }
    }
    catalog
        .default_model_for(provider)
        .map(|spec| spec.name.clone())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string())
}

/// Edits and wizard tasks run on the stability backend, which implements
/// the full task set; dryrun passes through for offline runs.
fn backend_for_edits(catalog: &ModelCatalog, session: &Session) -> (String, String) {
    let provider = session.provider.as_deref().unwrap_or(DEFAULT_PROVIDER);
    if provider == "dryrun" {
        return (
            "dryrun".to_string(),
            resolve_model(catalog, "dryrun", session.model.as_deref()),
        );
    }
    (
        "stability".to_string(),
        resolve_model(catalog, "stability", session.model.as_deref()),
    )
}

fn ensure_image_to_image(catalog: &ModelCatalog, provider: &str, model: String) -> String {
    if provider != "stability" {
        return model;
    }
    let supported = catalog
        .get(&model)
        .map(|spec| spec.supports("image_to_image"))
        .unwrap_or(false);
    if supported {
        model
    } else {
        DEFAULT_MODEL.to_string()
    }
}

fn wizard_label(kind: &str) -> String {
    kind.replace('_', " ")
}

fn describe_preset(preset: &Preset) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(model) = &preset.model {
        parts.push(format!("model={model}"));
    }
    if let Some(format) = &preset.format {
        parts.push(format!("format={format}"));
    }
    if let Some(style) = &preset.style {
        parts.push(format!("style={style}"));
    }
    if let Some(negative) = &preset.negative_prompt {
        parts.push(format!("negative={}", preview(negative, 30)));
    }
    if parts.is_empty() {
        "all defaults".to_string()
    } else {
        parts.join(" ")
    }
}

fn format_history_row(row: &HistoryEntry) -> String {
    let star = if row.favorite { "*" } else { " " };
    format!(
        "{star} {} [{}] {} ({}/{})",
        row.id,
        row.task,
        preview(&row.prompt, 40),
        row.provider,
        row.model
    )
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect::<String>() + "…"
}

fn string_arg(intent: &Intent, key: &str) -> Option<String> {
    intent
        .command_args
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn path_args(intent: &Intent, key: &str) -> Vec<String> {
    intent
        .command_args
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};

    use super::*;

    fn test_context(root: &Path) -> Result<ChatContext> {
        let sessions = Arc::new(SessionStore::new());
        let ledger = Arc::new(QuotaLedger::open(root.join("limits.json"))?);
        let history = Arc::new(GenerationHistory::open(root.join("history.json"))?);
        let presets = Arc::new(PresetStore::open(root.join("presets.json"))?);
        let audit = AuditLog::new(root.join("events.jsonl"), "easel-test");
        let pipeline = Arc::new(GenerationPipeline {
            providers: default_provider_registry(),
            translator: PromptTranslator::new(),
            watermark: Watermark::disabled(),
            store: Box::new(FsObjectStore::new(root.join("library"))),
            ledger: Arc::clone(&ledger),
            sessions: Arc::clone(&sessions),
            history: Arc::clone(&history),
            audit: audit.clone(),
            scratch_dir: root.join("outbox"),
        });
        Ok(ChatContext {
            sessions,
            ledger,
            history,
            presets,
            catalog: ModelCatalog::new(),
            pipeline,
            broker: MaskBroker::new(
                HttpMaskRelay::new("http://127.0.0.1:9"),
                "http://127.0.0.1:9/editor",
            ),
            audit,
            masks_dir: root.join("masks"),
            admin_id: None,
        })
    }

    fn collect(ctx: &ChatContext, user_id: u64, input: &str) -> Vec<String> {
        let mut replies = Vec::new();
        handle_message(ctx, user_id, input, &mut |text: String| replies.push(text));
        replies
    }

    fn joined(replies: &[String]) -> String {
        replies.join("\n")
    }

    fn write_png(path: &Path, width: u32, height: u32) -> Result<()> {
        let mut canvas = RgbaImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgba([200, 180, 160, 255]);
        }
        canvas.save(path)?;
        Ok(())
    }

    #[test]
    fn settings_flow_updates_session() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;

        collect(&ctx, 1, "/engine dryrun");
        collect(&ctx, 1, "/format 16:9");
        collect(&ctx, 1, "/style anime");
        collect(&ctx, 1, "/negative blurry, low quality");

        let session = ctx.sessions.snapshot(1);
        assert_eq!(session.provider.as_deref(), Some("dryrun"));
        assert_eq!(session.format.as_deref(), Some("16:9"));
        assert_eq!(session.style.as_deref(), Some("anime"));
        assert_eq!(session.negative_prompt.as_deref(), Some("blurry, low quality"));

        collect(&ctx, 1, "/style -");
        assert!(ctx.sessions.snapshot(1).style.is_none());
        Ok(())
    }

    #[test]
    fn model_selection_switches_provider() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;

        let replies = collect(&ctx, 1, "/model dall-e-3");
        assert!(joined(&replies).contains("engine openai"));
        let session = ctx.sessions.snapshot(1);
        assert_eq!(session.model.as_deref(), Some("dall-e-3"));
        assert_eq!(session.provider.as_deref(), Some("openai"));

        let rejected = collect(&ctx, 1, "/model sd99");
        assert!(joined(&rejected).contains("Unknown model"));
        Ok(())
    }

    #[test]
    fn invalid_format_is_rejected() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;

        let replies = collect(&ctx, 1, "/format 4:3");
        assert!(joined(&replies).contains("Unsupported aspect ratio"));
        assert!(ctx.sessions.snapshot(1).format.is_none());
        Ok(())
    }

    #[test]
    fn plain_text_generates_and_arms_refinement() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;

        collect(&ctx, 1, "/engine dryrun");
        let replies = collect(&ctx, 1, "a lighthouse at dusk");
        let all = joined(&replies);
        assert!(all.contains("Image ready:"));
        assert!(all.contains("9 free generations left."));

        let session = ctx.sessions.snapshot(1);
        assert!(session.in_refinement_mode);
        assert_eq!(session.prompt, "a lighthouse at dusk");
        assert!(session.last_image.is_some());
        let saved = session.saved_params.expect("saved params");
        assert_eq!(saved.prompt, "a lighthouse at dusk");
        assert_eq!(saved.provider, "dryrun");

        assert_eq!(ctx.ledger.record(1)?.used, 1);
        assert_eq!(ctx.history.count(1)?, 1);
        Ok(())
    }

    #[test]
    fn refinement_reuses_saved_parameters() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;

        collect(&ctx, 1, "/engine dryrun");
        collect(&ctx, 1, "/format 16:9");
        collect(&ctx, 1, "a lighthouse at dusk");

        // Settings changed after the snapshot must not affect refinement.
        collect(&ctx, 1, "/format 9:16");
        collect(&ctx, 1, "a lighthouse at dawn");

        let rows = ctx.history.list(1, 2)?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].prompt, "a lighthouse at dawn");
        assert_eq!(rows[0].format.as_deref(), Some("16:9"));
        assert!(rows[0].prompt_diff.is_some());
        Ok(())
    }

    #[test]
    fn wizard_style_transfer_completes_offline() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;
        let init = temp.path().join("init.png");
        let style = temp.path().join("style.png");
        write_png(&init, 64, 64)?;
        write_png(&style, 64, 64)?;

        collect(&ctx, 1, "/engine dryrun");
        let started = collect(&ctx, 1, "/styletransfer");
        assert!(joined(&started).contains("Send the image"));

        collect(&ctx, 1, &format!("/photo {}", init.display()));
        collect(&ctx, 1, &format!("/photo {}", style.display()));
        collect(&ctx, 1, "as an oil painting");
        collect(&ctx, 1, "-");
        collect(&ctx, 1, "0.7");
        collect(&ctx, 1, "-");
        let finished = collect(&ctx, 1, "-");

        assert!(joined(&finished).contains("Image ready:"));
        assert!(ctx.sessions.snapshot(1).wizard.is_none());
        assert_eq!(ctx.ledger.record(1)?.used, 1);
        let rows = ctx.history.list(1, 1)?;
        assert_eq!(rows[0].task, "style_transfer");
        Ok(())
    }

    #[test]
    fn wizard_rejects_text_where_image_expected() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;

        collect(&ctx, 1, "/styletransfer");
        let rejected = collect(&ctx, 1, "not an image");
        assert!(joined(&rejected).contains("An image is required"));

        let cancelled = collect(&ctx, 1, "/cancel");
        assert!(joined(&cancelled).contains("cancelled"));
        assert!(ctx.sessions.snapshot(1).wizard.is_none());
        Ok(())
    }

    #[test]
    fn inpaint_fallback_accepts_manual_mask() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;
        let source = temp.path().join("source.png");
        let mask = temp.path().join("mask.png");
        write_png(&source, 64, 48)?;
        write_png(&mask, 10, 10)?;

        collect(&ctx, 1, "/engine dryrun");
        collect(&ctx, 1, &format!("/editmy {}", source.display()));
        collect(&ctx, 1, "/engine dryrun");

        let started = collect(&ctx, 1, "/inpaint");
        assert!(joined(&started).contains("not reachable"));

        let advanced = collect(&ctx, 1, &format!("/photo {}", mask.display()));
        assert!(joined(&advanced).contains("Describe what to paint"));

        let finished = collect(&ctx, 1, "a sleeping cat");
        assert!(joined(&finished).contains("Image ready:"));
        assert!(ctx.sessions.snapshot(1).wizard.is_none());
        let rows = ctx.history.list(1, 1)?;
        assert_eq!(rows[0].task, "inpaint");
        Ok(())
    }

    #[test]
    fn done_without_wizard_explains() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;
        let replies = collect(&ctx, 1, "/done");
        assert!(joined(&replies).contains("No mask hand-off"));
        Ok(())
    }

    #[test]
    fn quota_exhaustion_blocks_generation() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;

        collect(&ctx, 1, "/engine dryrun");
        for _ in 0..10 {
            ctx.ledger.use_generation(1)?;
        }
        let replies = collect(&ctx, 1, "one more");
        assert!(joined(&replies).contains("used all 10 free generations"));
        assert_eq!(ctx.history.count(1)?, 0);
        Ok(())
    }

    #[test]
    fn editmy_then_upscale_chains() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;
        let source = temp.path().join("photo.png");
        write_png(&source, 32, 32)?;

        collect(&ctx, 1, &format!("/editmy {}", source.display()));
        collect(&ctx, 1, "/engine dryrun");
        let replies = collect(&ctx, 1, "/upscale");
        assert!(joined(&replies).contains("Image ready:"));

        let session = ctx.sessions.snapshot(1);
        assert!(session.last_image.is_some());
        let rows = ctx.history.list(1, 1)?;
        assert_eq!(rows[0].task, "upscale");
        assert!(rows[0].locator.as_deref().unwrap_or("").contains("/edited/"));
        Ok(())
    }

    #[test]
    fn edit_without_source_is_refused() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;
        let replies = collect(&ctx, 1, "/upscale");
        assert!(joined(&replies).contains("Nothing to edit yet"));
        Ok(())
    }

    #[test]
    fn reference_photo_routes_prompt_through_image_to_image() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;
        let reference = temp.path().join("ref.png");
        write_png(&reference, 32, 32)?;

        collect(&ctx, 1, "/engine dryrun");
        let added = collect(&ctx, 1, &format!("/photo {}", reference.display()));
        assert!(joined(&added).contains("Added 1 reference image"));

        let replies = collect(&ctx, 1, "in the style of a woodcut");
        assert!(joined(&replies).contains("Image ready:"));
        let rows = ctx.history.list(1, 1)?;
        assert_eq!(rows[0].task, "variations");
        // img2img does not arm prompt refinement.
        assert!(!ctx.sessions.snapshot(1).in_refinement_mode);
        Ok(())
    }

    #[test]
    fn missing_photo_path_is_reported() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;
        let replies = collect(&ctx, 1, "/photo /no/such/file.png");
        assert!(joined(&replies).contains("Cannot read"));
        assert!(ctx.sessions.snapshot(1).reference_images.is_empty());
        Ok(())
    }

    #[test]
    fn start_referral_rewards_on_first_generation() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;

        let started = collect(&ctx, 7, "/start 3");
        assert!(joined(&started).contains("user 3 earns +5"));

        collect(&ctx, 7, "/engine dryrun");
        let replies = collect(&ctx, 7, "first image");
        assert!(joined(&replies).contains("earned user 3 +5 generations"));

        assert_eq!(ctx.ledger.referral_stats(3)?.earned, 5);
        // Second generation must not reward again.
        collect(&ctx, 7, "second image");
        assert_eq!(ctx.ledger.referral_stats(3)?.earned, 5);
        Ok(())
    }

    #[test]
    fn self_referral_is_ignored_silently() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;
        let replies = collect(&ctx, 7, "/start 7");
        assert!(!joined(&replies).contains("Referral registered"));
        assert!(joined(&replies).contains("Welcome"));
        Ok(())
    }

    #[test]
    fn profile_shows_quota_and_referral_code() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;

        collect(&ctx, 5, "/engine dryrun");
        collect(&ctx, 5, "a quiet harbor");
        let replies = collect(&ctx, 5, "/profile");
        let all = joined(&replies);
        assert!(all.contains("1 used of 10"));
        assert!(all.contains("/start 5"));
        assert!(all.contains("Current prompt: a quiet harbor"));
        Ok(())
    }

    #[test]
    fn preset_save_apply_cycle() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;

        collect(&ctx, 1, "/format 16:9");
        collect(&ctx, 1, "/style anime");
        let saved = collect(&ctx, 1, "/preset save wide");
        assert!(joined(&saved).contains("saved"));

        collect(&ctx, 1, "/new");
        assert!(ctx.sessions.snapshot(1).format.is_none());

        let applied = collect(&ctx, 1, "/preset use wide");
        assert!(joined(&applied).contains("applied"));
        let session = ctx.sessions.snapshot(1);
        assert_eq!(session.format.as_deref(), Some("16:9"));
        assert_eq!(session.style.as_deref(), Some("anime"));

        let duplicate = collect(&ctx, 1, "/preset save wide");
        assert!(joined(&duplicate).contains("already exists"));
        Ok(())
    }

    #[test]
    fn library_counts_and_favorites() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;

        collect(&ctx, 1, "/engine dryrun");
        collect(&ctx, 1, "a lighthouse");
        let summary = collect(&ctx, 1, "/lib");
        assert!(joined(&summary).contains("1 generated"));

        let id = ctx.history.list(1, 1)?[0].id.clone();
        let toggled = collect(&ctx, 1, &format!("/fav {id}"));
        assert!(joined(&toggled).contains("Marked as favorite"));
        let favorites = collect(&ctx, 1, "/lib favorites");
        assert!(joined(&favorites).contains(&id));
        Ok(())
    }

    #[test]
    fn admin_commands_respect_gate() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let mut ctx = test_context(temp.path())?;

        let denied = collect(&ctx, 1, "/admin_add 5 20");
        assert!(joined(&denied).contains("not allowed"));

        ctx.admin_id = Some(1);
        let granted = collect(&ctx, 1, "/admin_add 5 20");
        assert!(joined(&granted).contains("Granted 20 generations to user 5"));

        let malformed = collect(&ctx, 1, "/admin_add five ten");
        assert!(joined(&malformed).contains("Usage"));

        let listed = collect(&ctx, 1, "/admin_users");
        assert!(joined(&listed).contains("5: used 0"));
        Ok(())
    }

    #[test]
    fn unknown_command_mentions_help() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;
        let replies = collect(&ctx, 1, "/magic");
        assert!(joined(&replies).contains("Unknown command '/magic'"));
        assert!(joined(&replies).contains("/help"));
        Ok(())
    }

    #[test]
    fn more_does_not_stack_variation_suffixes() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;

        collect(&ctx, 1, "/engine dryrun");
        collect(&ctx, 1, "a red fox");
        collect(&ctx, 1, "/more");
        collect(&ctx, 1, "/more");

        let saved = ctx.sessions.snapshot(1).saved_params.expect("saved params");
        assert_eq!(saved.prompt, "a red fox");
        let rows = ctx.history.list(1, 1)?;
        assert_eq!(rows[0].prompt, "a red fox, variation, different composition");
        Ok(())
    }

    #[test]
    fn reset_discards_in_flight_session_update() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let ctx = test_context(temp.path())?;
        collect(&ctx, 1, "/engine dryrun");

        // Simulate a /new that lands while a generation is in flight: the
        // dispatch runs against the pre-reset epoch.
        let stale_epoch = ctx.sessions.snapshot(1).epoch;
        ctx.sessions.reset(1);
        let request = GenerationRequest {
            provider: "dryrun".to_string(),
            model: "dryrun-image-1".to_string(),
            task: ImageTask::TextToImage {
                prompt: "slow boat".to_string(),
                negative_prompt: None,
                aspect_ratio: "1:1".to_string(),
                style_preset: None,
            },
        };
        let outcome = ctx.pipeline.dispatch(1, stale_epoch, &request)?;
        assert!(!outcome.session_updated);
        assert!(ctx.sessions.snapshot(1).last_image.is_none());
        Ok(())
    }
}
