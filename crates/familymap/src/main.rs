//! `famap` - CLI for familymap
//!
//! This binary signs in, shares the device position and keeps the family map
//! page up to date.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;

use familymap::app::position_source;
use familymap::backend::{MemberStore, SupabaseClient};
use familymap::cli::{
    CacheCommand, Cli, Command, ConfigCommand, CredentialArgs, MapCommand, MembersCommand,
    OutputFormat, PublishCommand, RunCommand,
};
use familymap::device::{Position, PositionFix};
use familymap::map::{HtmlFileSurface, MapRenderer, MapSurface, PageOptions};
use familymap::roster::{LocationUpdate, RosterFetcher};
use familymap::session::{SignUpOutcome, CONFIRMATION_PROMPT};
use familymap::ui::{MemberRow, TerminalSink};
use familymap::{init_logging, App, Config, Credentials, LocalStore, Session, SessionManager};

type StdinLines = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone()).context("loading configuration")?;

    // Execute the command
    match cli.command {
        Command::Run(cmd) => handle_run(config, &cmd).await,
        Command::SignIn(args) => handle_sign_in(&config, args).await,
        Command::SignUp(args) => handle_sign_up(&config, args).await,
        Command::SignOut => handle_sign_out(&config).await,
        Command::Status(cmd) => handle_status(&config, cmd.json),
        Command::Members(cmd) => handle_members(&config, &cmd).await,
        Command::Map(cmd) => handle_map(&config, &cmd).await,
        Command::Publish(cmd) => handle_publish(&config, &cmd).await,
        Command::Cache(cmd) => handle_cache(&config, cmd),
        Command::Config(cmd) => handle_config(&config, cmd),
    }
}

fn open_cache(config: &Config) -> anyhow::Result<Arc<LocalStore>> {
    let path = config.database_path();
    let store = LocalStore::open(&path)
        .with_context(|| format!("opening cache at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn connect(config: &Config) -> anyhow::Result<(Arc<SupabaseClient>, SessionManager)> {
    config.require_backend()?;
    let client = Arc::new(SupabaseClient::new(&config.backend)?);
    let sessions = SessionManager::new(client.clone(), Some(open_cache(config)?));
    Ok((client, sessions))
}

/// Restore the cached session or explain how to get one.
async fn require_session(sessions: &SessionManager) -> anyhow::Result<Session> {
    match sessions.start().await {
        Some(session) => Ok(session),
        None => bail!("not signed in; run `famap signin --email <EMAIL>` first"),
    }
}

async fn read_password(lines: &mut StdinLines) -> anyhow::Result<String> {
    eprint!("Password: ");
    std::io::stderr().flush()?;
    lines
        .next_line()
        .await?
        .context("no password given on stdin")
}

async fn credentials(args: CredentialArgs) -> anyhow::Result<Credentials> {
    let password = match args.password {
        Some(password) => password,
        None => read_password(&mut BufReader::new(tokio::io::stdin()).lines()).await?,
    };
    Ok(Credentials::new(args.email, password))
}

async fn handle_run(mut config: Config, cmd: &RunCommand) -> anyhow::Result<()> {
    if let Some(source) = cmd.source {
        config.location.source = source.into();
    }
    if let Some(output) = &cmd.output {
        config.map.output_path = Some(output.clone());
    }
    if cmd.no_realtime {
        config.realtime.enabled = false;
    }
    config.validate()?;

    let sink = TerminalSink::new(std::io::stdout());
    let mut app = App::from_config(&config, Box::new(sink))?;
    app.start().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while app.sessions().current().is_none() {
        eprint!("Email (or \"switch\" to {}): ", app.form().mode().toggled().submit_label());
        std::io::stderr().flush()?;
        let Some(email) = lines.next_line().await? else {
            bail!("not signed in");
        };
        let email = email.trim();
        if email.is_empty() {
            continue;
        }
        if email == "switch" {
            app.toggle_form();
            continue;
        }
        let password = read_password(&mut lines).await?;
        app.submit(&Credentials::new(email, password)).await;
    }

    println!("Map page: {}", config.map_output_path().display());
    app.run(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

async fn handle_sign_in(config: &Config, args: CredentialArgs) -> anyhow::Result<()> {
    let (_, sessions) = connect(config)?;
    let session = sessions.sign_in(&credentials(args).await?).await?;
    println!(
        "Signed in as {}",
        session.user.email.as_deref().unwrap_or("(no email)")
    );
    Ok(())
}

async fn handle_sign_up(config: &Config, args: CredentialArgs) -> anyhow::Result<()> {
    let (_, sessions) = connect(config)?;
    match sessions.sign_up(&credentials(args).await?).await? {
        SignUpOutcome::SignedIn(session) => println!(
            "Signed up and signed in as {}",
            session.user.email.as_deref().unwrap_or("(no email)")
        ),
        SignUpOutcome::ConfirmationRequired { .. } => println!("{CONFIRMATION_PROMPT}"),
    }
    Ok(())
}

async fn handle_sign_out(config: &Config) -> anyhow::Result<()> {
    let (_, sessions) = connect(config)?;
    if sessions.start().await.is_none() {
        println!("Not signed in.");
        return Ok(());
    }
    sessions.sign_out().await;
    println!("Signed out.");
    Ok(())
}

fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let stats = open_cache(config)?.stats()?;
    let signed_in = stats
        .session_expires_at
        .is_some_and(|expires| expires > chrono::Utc::now());

    if json {
        let status = serde_json::json!({
            "backend_url": config.backend.url,
            "signed_in": signed_in,
            "user_id": stats.user_id,
            "email": stats.email,
            "session_expires_at": stats.session_expires_at,
            "cached_members": stats.roster_members,
            "roster_fetched_at": stats.roster_fetched_at,
            "database_path": config.database_path(),
            "map_path": config.map_output_path(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("famap status");
        println!("------------");
        println!(
            "Backend:        {}",
            if config.backend.url.is_empty() {
                "(not configured)"
            } else {
                config.backend.url.as_str()
            }
        );
        match stats.email.as_ref().or(stats.user_id.as_ref()) {
            Some(who) if signed_in => println!("Signed in:      {who}"),
            Some(who) => println!("Signed in:      {who} (session expired)"),
            None => println!("Signed in:      no"),
        }
        println!("Cached members: {}", stats.roster_members);
        if let Some(fetched) = stats.roster_fetched_at {
            println!(
                "Last fetch:     {}",
                fetched.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
            );
        }
        println!("Database:       {}", config.database_path().display());
        println!("Map page:       {}", config.map_output_path().display());
    }
    Ok(())
}

async fn fetch_roster(config: &Config) -> anyhow::Result<(Session, Vec<familymap::Member>)> {
    let (client, sessions) = connect(config)?;
    let session = require_session(&sessions).await?;
    let roster = RosterFetcher::new(
        client,
        sessions.subscribe(),
        config.storage.cache_roster.then(|| open_cache(config)).transpose()?,
    );
    roster.refresh().await?;
    Ok((session, roster.members()))
}

async fn handle_members(config: &Config, cmd: &MembersCommand) -> anyhow::Result<()> {
    let (user, members) = if cmd.cached {
        let cache = open_cache(config)?;
        let user = cache.load_session()?.map(|s| s.user_id());
        (user, cache.load_roster()?.unwrap_or_default())
    } else {
        let (session, members) = fetch_roster(config).await?;
        (Some(session.user_id()), members)
    };

    match cmd.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&members)?),
        OutputFormat::Plain => {
            for member in &members {
                println!("{}\t{}", member.display_name(), member.last_seen());
            }
        }
        OutputFormat::Table => {
            println!("MEMBERS ({})", members.len());
            for member in &members {
                println!("  {}", MemberRow::new(member, user));
            }
        }
    }
    Ok(())
}

async fn handle_map(config: &Config, cmd: &MapCommand) -> anyhow::Result<()> {
    let (_, members) = fetch_roster(config).await?;
    let path = cmd.output.clone().unwrap_or_else(|| config.map_output_path());

    let mut renderer = MapRenderer::from_config(&config.map);
    let update = renderer.render(&members);
    let mut surface = HtmlFileSurface::new(&path, PageOptions::from_config(&config.map));
    surface.present(&update)?;

    println!(
        "Wrote {} with {} of {} members on the map",
        path.display(),
        update.view.markers.len(),
        members.len()
    );
    Ok(())
}

async fn handle_publish(config: &Config, cmd: &PublishCommand) -> anyhow::Result<()> {
    let (client, sessions) = connect(config)?;
    let session = require_session(&sessions).await?;

    let position = match (cmd.lat, cmd.lng) {
        (Some(lat), Some(lng)) => {
            Position::new(lat, lng).with_context(|| format!("invalid coordinates {lat}, {lng}"))?
        }
        _ => first_fix(config).await?.position,
    };

    let update = LocationUpdate::new(session.user_id(), position);
    client.upsert_location(&session, &update).await?;
    println!("Published {position}");
    Ok(())
}

/// Wait for one fix from the configured position source.
async fn first_fix(config: &Config) -> anyhow::Result<PositionFix> {
    let source = position_source(config)?;
    let options = config.watch_options();
    let (tx, mut rx) = mpsc::channel(1);
    let mut watch = source.watch(options, tx)?;

    let event = tokio::time::timeout(options.timeout, rx.recv()).await;
    watch.clear();
    match event {
        Ok(Some(Ok(fix))) => Ok(fix),
        Ok(Some(Err(e))) => bail!("{} source: {e}", source.name()),
        Ok(None) => bail!("{} source stopped without a position", source.name()),
        Err(_) => bail!("no position from {} within {:?}", source.name(), options.timeout),
    }
}

fn handle_cache(config: &Config, cmd: CacheCommand) -> anyhow::Result<()> {
    match cmd {
        CacheCommand::Clear { yes } => {
            if !yes {
                println!("This will forget your session and the cached roster.");
                println!("Use --yes to confirm.");
                return Ok(());
            }
            open_cache(config)?.clear()?;
            let map = config.map_output_path();
            if map.exists() {
                std::fs::remove_file(&map)
                    .with_context(|| format!("removing {}", map.display()))?;
            }
            println!("Local cache cleared.");
        }
        CacheCommand::Stats { json } => {
            let stats = open_cache(config)?.stats()?;
            if json {
                let stats = serde_json::json!({
                    "user_id": stats.user_id,
                    "email": stats.email,
                    "session_expires_at": stats.session_expires_at,
                    "roster_members": stats.roster_members,
                    "roster_fetched_at": stats.roster_fetched_at,
                    "db_size_bytes": stats.db_size_bytes,
                });
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Cache Statistics");
                println!("================");
                println!("Database:        {}", config.database_path().display());
                println!("Size:            {} bytes", stats.db_size_bytes);
                println!(
                    "Session:         {}",
                    stats.email.as_deref().unwrap_or("none")
                );
                println!("Roster members:  {}", stats.roster_members);
            }
        }
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Backend]");
                println!("  URL:                {}", config.backend.url);
                println!(
                    "  Anon key:           {}",
                    if config.backend.anon_key.is_empty() {
                        "(not set)"
                    } else {
                        "(set)"
                    }
                );
                println!(
                    "  Table:              {}.{}",
                    config.backend.schema, config.backend.table
                );
                println!();
                println!("[Location]");
                println!("  Source:             {:?}", config.location.source);
                println!("  High accuracy:      {}", config.location.high_accuracy);
                println!("  Maximum age (ms):   {}", config.location.maximum_age_ms);
                println!("  Timeout (ms):       {}", config.location.timeout_ms);
                println!();
                println!("[Realtime]");
                println!("  Enabled:            {}", config.realtime.enabled);
                println!("  Debounce (ms):      {}", config.realtime.debounce_ms);
                println!();
                println!("[Map]");
                println!("  Fallback center:    {}", config.fallback_center());
                println!("  Zoom:               {}", config.map.zoom);
                println!("  Recenter:           {:?}", config.map.recenter);
                println!("  Page:               {}", config.map_output_path().display());
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!("  Cache roster:       {}", config.storage.cache_roster);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
