use std::io::{self, BufRead};
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use lllang::error::ValidationError;
use lllang::identity::{ChatPageParams, resolve_user_id, with_user_id};
use lllang::net::types::PartOfSpeech;
use lllang::net::{ChatApi, DictApi};
use lllang::services::chat::{self, ChatCommand, ChatOutcome, ChatTiming};
use lllang::services::dictionary::DictionaryService;
use lllang::services::room::{self, RoomCommand, RoomEvent, RoomService};
use lllang::state::chat::Effect;
use lllang::state::registration::{RegistrationForm, format_birth_date_input};
use lllang::state::room::{EntryPage, RoomEffect, RoomImage};
use lllang::state::search::{EMPTY_MESSAGE, SearchView};
use lllang::state::translations::{STABLE_AFTER, TranslationEditor};
use lllang::{ClientConfig, Error};
use reqwest::Url;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{}", .0.user_message())]
    Client(#[from] Error),
    #[error("invalid page URL: {0}")]
    InvalidPageUrl(String),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("at most three translations are allowed")]
    TooManyTranslations,
}

#[derive(Parser, Debug)]
#[command(name = "lllang", about = "lllang matching chat and dictionary client")]
struct Cli {
    #[arg(long, env = "LLLANG_CHAT_BASE_URL")]
    chat_base_url: Option<String>,

    #[arg(long, env = "LLLANG_DICT_BASE_URL")]
    dict_base_url: Option<String>,

    #[arg(long, env = "LLLANG_USER_ID")]
    user_id: Option<String>,

    /// Page URL the app was opened with (query or Telegram fragment).
    #[arg(long, env = "LLLANG_PAGE_URL")]
    page_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug)]
struct CliContext {
    config: ClientConfig,
    page_url: Option<Url>,
}

impl CliContext {
    fn user_id(&self) -> Result<String, CliError> {
        resolve_user_id(self.config.user_id.as_deref(), self.page_url.as_ref())
            .ok_or(CliError::Client(Error::MissingUserId))
    }

    /// The page URL with the resolved user id written into its query.
    fn page_url_with_user_id(&self, user_id: &str) -> Option<Url> {
        self.page_url.as_ref().map(|url| with_user_id(url, user_id))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    Room(RoomArgs),
    Chat(ChatArgs),
    Dict(DictArgs),
}

#[derive(Args, Debug)]
struct RoomArgs {
    #[command(subcommand)]
    command: RoomSubcommand,
}

#[derive(Subcommand, Debug)]
enum RoomSubcommand {
    /// Which page the app would open on.
    Entry,
    /// Queue size, membership and match, fetched once.
    Status,
    /// Poll the queue interactively: `t` toggles, `e` enters, `q` quits.
    Queue {
        /// Enter the chat as soon as a partner is found.
        #[arg(long, default_value_t = false)]
        auto_enter: bool,
    },
    Register(RegisterArgs),
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[arg(long)]
    nickname: String,
    #[arg(long)]
    email: String,
    /// Digits or `DD-MM-YYYY`.
    #[arg(long)]
    birth_date: String,
    #[arg(long)]
    gender: String,
    #[arg(long, default_value = "")]
    intro: String,
    #[arg(long, default_value_t = false)]
    dating: bool,
    #[arg(long, requires = "longitude")]
    latitude: Option<f64>,
    #[arg(long, requires = "latitude")]
    longitude: Option<f64>,
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(long, requires = "token")]
    room_id: Option<String>,
    #[arg(long, requires = "room_id")]
    token: Option<String>,
    #[arg(long)]
    match_id: Option<String>,
}

#[derive(Args, Debug)]
struct DictArgs {
    #[command(subcommand)]
    command: DictSubcommand,
}

#[derive(Subcommand, Debug)]
enum DictSubcommand {
    List,
    /// Step through the cards: `n` next, `p` prev, `d` delete, `q` quit.
    Browse,
    Add(WordArgs),
    Edit {
        word_id: String,
        #[command(flatten)]
        changes: WordChanges,
    },
    Delete {
        word_id: String,
    },
    Search {
        query: String,
    },
    Stats,
}

#[derive(Args, Debug)]
struct WordArgs {
    #[arg(long)]
    word: String,
    /// `POS:TEXT`, e.g. `noun:яблоко`. Up to three.
    #[arg(long = "translation", value_parser = parse_translation, required = true)]
    translations: Vec<(PartOfSpeech, String)>,
    #[arg(long, default_value = "")]
    context: String,
    #[arg(long, default_value_t = false)]
    public: bool,
}

#[derive(Args, Debug)]
struct WordChanges {
    #[arg(long)]
    word: Option<String>,
    #[arg(long = "translation", value_parser = parse_translation)]
    translations: Vec<(PartOfSpeech, String)>,
    #[arg(long)]
    context: Option<String>,
    #[arg(long)]
    public: Option<bool>,
}

fn parse_translation(raw: &str) -> Result<(PartOfSpeech, String), String> {
    let (code, text) = raw.split_once(':').ok_or_else(|| format!("expected POS:TEXT, got `{raw}`"))?;
    let pos = PartOfSpeech::from_code(code.trim()).ok_or_else(|| format!("unknown part of speech `{code}`"))?;
    Ok((pos, text.trim().to_owned()))
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env();
    if let Some(url) = cli.chat_base_url {
        config.chat_base_url = url.trim_end_matches('/').to_owned();
    }
    if let Some(url) = cli.dict_base_url {
        config.dict_base_url = url.trim_end_matches('/').to_owned();
    }
    if cli.user_id.is_some() {
        config.user_id = cli.user_id;
    }
    let page_url = cli
        .page_url
        .map(|raw| Url::parse(&raw).map_err(|e| CliError::InvalidPageUrl(format!("{raw}: {e}"))))
        .transpose()?;
    debug!(
        chat_base_url = %config.chat_base_url,
        dict_base_url = %config.dict_base_url,
        has_page_url = page_url.is_some(),
        "configuration resolved"
    );
    let ctx = CliContext { config, page_url };

    match cli.command {
        Command::Room(args) => run_room(&ctx, args).await,
        Command::Chat(args) => run_chat(&ctx, args).await,
        Command::Dict(args) => run_dict(&ctx, args).await,
    }
}

// =============================================================================
// ROOM
// =============================================================================

async fn run_room(ctx: &CliContext, args: RoomArgs) -> Result<(), CliError> {
    let api = ChatApi::from_config(&ctx.config)?;
    match args.command {
        RoomSubcommand::Entry => {
            let user_id = ctx.user_id().ok();
            let page = room::entry(&api, user_id.as_deref()).await;
            println!(
                "{}",
                match page {
                    EntryPage::Welcome => "welcome: open the app from Telegram",
                    EntryPage::Registration => "registration",
                    EntryPage::Room => "room",
                }
            );
            if let Some(url) = user_id.as_deref().and_then(|id| ctx.page_url_with_user_id(id)) {
                println!("page: {url}");
            }
            Ok(())
        }
        RoomSubcommand::Status => {
            let mut service = RoomService::new(api, ctx.user_id()?, ctx.config.poll);
            service.init().await;
            let state = service.state();
            println!("queue size: {}", state.queue_size());
            println!("in queue:   {}", state.in_queue());
            match state.matched() {
                Some(found) => println!("match:      {} (room {})", found.match_id, found.room_id),
                None => println!("match:      none"),
            }
            Ok(())
        }
        RoomSubcommand::Queue { auto_enter } => run_queue(ctx, api, auto_enter).await,
        RoomSubcommand::Register(args) => {
            let user_id = ctx.user_id()?;
            let form = RegistrationForm {
                nickname: args.nickname,
                email: args.email,
                birth_date: format_birth_date_input(&args.birth_date),
                gender: Some(args.gender),
                intro: args.intro,
                dating: args.dating,
                location: args.latitude.zip(args.longitude).map(|(latitude, longitude)| {
                    lllang::net::types::Location { latitude, longitude }
                }),
            };
            room::register(&api, &form, &user_id, today()).await?;
            println!("registered");
            Ok(())
        }
    }
}

async fn run_queue(ctx: &CliContext, api: ChatApi, auto_enter: bool) -> Result<(), CliError> {
    let user_id = ctx.user_id()?;
    let (command_tx, command_rx) = mpsc::channel(8);
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = RoomService::new(api.clone(), user_id, ctx.config.poll);
    let runner = tokio::spawn(service.run(command_rx, event_tx, shutdown_rx));
    let mut lines = spawn_stdin_lines();

    eprintln!("commands: t(oggle queue), e(nter chat), q(uit)");
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                render_room_event(&event);
                if auto_enter && matches!(event, RoomEvent::Effect(RoomEffect::MatchFound(_))) {
                    let _ = command_tx.send(RoomCommand::EnterChat).await;
                }
            }
            line = lines.recv() => match line.as_deref().map(str::trim) {
                Some("t" | "toggle") => {
                    let _ = command_tx.send(RoomCommand::Toggle).await;
                }
                Some("e" | "enter") => {
                    let _ = command_tx.send(RoomCommand::EnterChat).await;
                }
                Some("q" | "quit") | None => {
                    let _ = shutdown_tx.send(true);
                    break;
                }
                Some(_) => eprintln!("commands: t(oggle queue), e(nter chat), q(uit)"),
            },
        }
    }

    let Some(link) = runner.await? else {
        return Ok(());
    };
    info!(%link, "leaving room for chat");
    println!("entering chat: {link}");
    let page = Url::parse("http://localhost/")
        .and_then(|base| base.join(&link))
        .map_err(|e| CliError::InvalidPageUrl(format!("{link}: {e}")))?;
    let params = ChatPageParams::from_url(&page)?;
    chat_session(ctx, &api, &params, lines).await
}

fn render_room_event(event: &RoomEvent) {
    match event {
        RoomEvent::Effect(RoomEffect::Image(image)) => println!(
            "[room] {}",
            match image {
                RoomImage::Empty => "empty",
                RoomImage::HalfFull => "half full",
                RoomImage::Full => "full",
                RoomImage::Door => "someone is at the door",
            }
        ),
        RoomEvent::Effect(RoomEffect::SearchMessage(Some(text))) => println!("[search] {text}"),
        RoomEvent::Effect(RoomEffect::SearchMessage(None)) => {}
        RoomEvent::Effect(RoomEffect::MatchFound(found)) => {
            println!("[match] partner found (match {}, room {})", found.match_id, found.room_id);
        }
        RoomEvent::Status(line) => println!("[status] {line}"),
        RoomEvent::Error(message) => eprintln!("! {message}"),
    }
}

// =============================================================================
// CHAT
// =============================================================================

async fn run_chat(ctx: &CliContext, args: ChatArgs) -> Result<(), CliError> {
    let api = ChatApi::from_config(&ctx.config)?;
    let params = match (args.room_id, args.token) {
        (Some(room_id), Some(token)) => {
            ChatPageParams { user_id: ctx.user_id()?, match_id: args.match_id, room_id, token }
        }
        _ => {
            let url = ctx.page_url.as_ref().ok_or(CliError::Client(Error::MissingParam("room_id")))?;
            let mut params = ChatPageParams::from_url(url)?;
            if let Some(user_id) = &ctx.config.user_id {
                params.user_id.clone_from(user_id);
            }
            params
        }
    };
    chat_session(ctx, &api, &params, spawn_stdin_lines()).await
}

async fn chat_session(
    ctx: &CliContext,
    api: &ChatApi,
    params: &ChatPageParams,
    mut lines: mpsc::Receiver<String>,
) -> Result<(), CliError> {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (effect_tx, mut effects) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            let command = match line.trim() {
                "/quit" => break,
                "/exit" => ChatCommand::Exit { aborted: false },
                "/abort" => ChatCommand::Exit { aborted: true },
                "/report" => ChatCommand::Report,
                _ => ChatCommand::Send(line),
            };
            if command_tx.send(command).await.is_err() {
                break;
            }
        }
    });
    let printer = tokio::spawn(async move {
        while let Some(effect) = effects.recv().await {
            render_chat_effect(&effect);
        }
    });

    eprintln!("type to chat; /exit, /abort, /report, /quit");
    let offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timing = ChatTiming::from_config(&ctx.config, offset);
    let outcome =
        chat::connect_and_run(api, &ctx.config.chat_base_url, params, timing, command_rx, effect_tx).await?;
    printer.await?;
    info!(room_id = %params.room_id, ?outcome, "chat finished");

    match outcome {
        ChatOutcome::Exited { redirect } => println!("back to the room: {redirect}"),
        ChatOutcome::Detached { end_reason: Some(reason) } => println!("session ended: {reason}"),
        ChatOutcome::Detached { end_reason: None } => {}
    }
    Ok(())
}

fn render_chat_effect(effect: &Effect) {
    match effect {
        Effect::ShowWaiting => println!("* waiting for your partner..."),
        Effect::Countdown { seconds_left, .. } => {
            if *seconds_left % 10 == 0 || *seconds_left <= 3 {
                println!("* {seconds_left}s left");
            }
        }
        Effect::ShowChat => println!("* partner joined"),
        Effect::PartnerNickname(name) => println!("* chatting with {name}"),
        Effect::PartnerStatus { online } => println!("* partner {}", if *online { "online" } else { "offline" }),
        Effect::AppendMessage { message, mine, time_label } => {
            let who = if *mine { "you" } else { message.sender.as_str() };
            println!("[{time_label}] {who}: {}", message.text);
        }
        Effect::SystemLine(text) => println!("* {text}"),
        Effect::SessionEnded { reason } => println!("* session ended: {reason} (/exit to return to the room)"),
        Effect::ExitLocked(true) => println!("* leaving..."),
        Effect::ExitLocked(false) | Effect::CloseSocket => {}
        Effect::Notice(text) => eprintln!("! {text}"),
    }
}

// =============================================================================
// DICTIONARY
// =============================================================================

async fn run_dict(ctx: &CliContext, args: DictArgs) -> Result<(), CliError> {
    let mut dict = DictionaryService::new(DictApi::from_config(&ctx.config)?, ctx.user_id()?);
    match args.command {
        DictSubcommand::List => {
            dict.load_words().await?;
            print_json(&serde_json::to_value(dict.deck.words())?)
        }
        DictSubcommand::Browse => browse(&mut dict).await,
        DictSubcommand::Add(args) => {
            dict.form.word = args.word;
            dict.form.context = args.context;
            dict.form.is_public = args.public;
            fill_translations(&mut dict.form.translations, &args.translations)?;
            println!("{}", dict.submit_form().await?);
            Ok(())
        }
        DictSubcommand::Edit { word_id, changes } => {
            dict.load_words().await?;
            dict.start_edit(&word_id)?;
            if let Some(word) = changes.word {
                dict.form.word = word;
            }
            if let Some(context) = changes.context {
                dict.form.context = context;
            }
            if let Some(public) = changes.public {
                dict.form.is_public = public;
            }
            if !changes.translations.is_empty() {
                fill_translations(&mut dict.form.translations, &changes.translations)?;
            }
            println!("{}", dict.submit_form().await?);
            Ok(())
        }
        DictSubcommand::Delete { word_id } => {
            println!("{}", dict.delete_word(&word_id).await?);
            Ok(())
        }
        DictSubcommand::Search { query } => {
            render_search(&dict.search(&query).await?);
            Ok(())
        }
        DictSubcommand::Stats => {
            let stats = dict.load_stats().await?;
            println!("total:      {}", stats.total);
            println!("nouns:      {}", stats.nouns);
            println!("verbs:      {}", stats.verbs);
            println!("adjectives: {}", stats.adjectives);
            println!("adverbs:    {}", stats.adverbs);
            println!("others:     {}", stats.others);
            Ok(())
        }
    }
}

/// Fill the editor field by field, the way the form grows one field at a time.
fn fill_translations(editor: &mut TranslationEditor, entries: &[(PartOfSpeech, String)]) -> Result<(), CliError> {
    editor.reset();
    let mut id = editor.first_id();
    let mut now = Instant::now();
    for (index, (pos, text)) in entries.iter().enumerate() {
        if text.trim().is_empty() {
            return Err(Error::Validation(ValidationError::MissingTranslation).into());
        }
        if index > 0 {
            now += STABLE_AFTER;
            id = editor.add_after(id, now).ok_or(CliError::TooManyTranslations)?;
        }
        editor.set_text(id, text, now);
        editor.set_part_of_speech(id, Some(*pos));
    }
    Ok(())
}

async fn browse(dict: &mut DictionaryService<DictApi>) -> Result<(), CliError> {
    dict.load_words().await?;
    let mut lines = spawn_stdin_lines();
    loop {
        match dict.deck.card() {
            Some(card) => {
                println!("[{}] {} - {} ({})", card.counter, card.word, card.translation, card.part_of_speech);
                if let Some(context) = card.context.as_deref().filter(|c| !c.is_empty()) {
                    println!("    {context}");
                }
                if let Some(audio) = &card.audio_url {
                    println!("    audio: {audio}");
                }
            }
            None => println!("Your dictionary is empty"),
        }
        let Some(line) = lines.recv().await else { return Ok(()) };
        match line.trim() {
            "n" => {
                dict.deck.next();
            }
            "p" => {
                dict.deck.prev();
            }
            "d" => match dict.delete_current().await {
                Ok(notice) => println!("{notice}"),
                Err(error) => eprintln!("! {}", error.user_message()),
            },
            "q" => return Ok(()),
            _ => eprintln!("commands: n(ext), p(rev), d(elete), q(uit)"),
        }
    }
}

fn render_search(view: &SearchView) {
    match view {
        SearchView::Empty { query } => println!("{query}: {EMPTY_MESSAGE}"),
        SearchView::Results { query, user_word, others } => {
            println!("results for `{query}`");
            if let Some(own) = user_word {
                println!("  yours: {} ({}) - {}", own.word, own.part_of_speech, own.translations.join(", "));
            }
            for other in others {
                let created = other.created.as_deref().unwrap_or("-");
                println!("  {} - {} by {} on {created}", other.word, other.translation, other.nickname);
            }
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Read stdin lines on a plain thread so a pending read never holds up exit.
fn spawn_stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn today() -> time::Date {
    time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc()).date()
}

fn print_json(value: &Value) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
