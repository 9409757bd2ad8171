//! Emoji release demo
//!
//! Shows a list of emojis whose layout and theme are remembered across runs.

mod screen;

use anyhow::Context;
use app_state::{AppConfig, EmojiReleaseApplication, EmojiScreenViewModel};
use screen::Command;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}

fn app_config() -> anyhow::Result<AppConfig> {
    let data_dir = dirs::data_dir()
        .context("no data directory on this platform")?
        .join("emoji-release");
    Ok(AppConfig::new(data_dir))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = app_config()?;
    init_tracing(&config.log_filter);

    let app = EmojiReleaseApplication::start(config).context("failed to open preferences")?;
    let view_model = app.view_model();
    tracing::info!(data_dir = %app.config().data_dir.display(), "emoji release ready");

    let renderer = {
        let mut ui_state = view_model.subscribe();
        tokio::spawn(async move {
            println!("{}", screen::render(&ui_state.current()));
            while let Some(state) = ui_state.changed().await {
                println!("{}", screen::render(&state));
            }
        })
    };

    println!("commands: l = layout, t = theme, <n> = click emoji n, q = quit");
    run_commands(&view_model).await?;

    view_model.flush_writes().await;
    renderer.abort();
    drop(view_model);
    app.shutdown().await?;
    Ok(())
}

/// What the command loop does after a line of input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

async fn run_commands(view_model: &EmojiScreenViewModel) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if handle(view_model, &line) == Flow::Quit {
            break;
        }
    }

    Ok(())
}

fn handle(view_model: &EmojiScreenViewModel, line: &str) -> Flow {
    let state = view_model.ui_state().value();
    match Command::parse(line) {
        Some(Command::ToggleLayout) => view_model.select_layout(!state.is_linear_layout),
        Some(Command::ToggleTheme) => view_model.toggle_theme(!state.is_dark_theme),
        Some(Command::Click(index)) => match screen::describe(index) {
            Some(message) => println!("{message}"),
            None => {
                tracing::warn!(index, "click outside the emoji list");
                println!("no emoji at {index}");
            }
        },
        Some(Command::Quit) => {
            tracing::info!("quit requested");
            return Flow::Quit;
        }
        None => {
            tracing::debug!(input = line.trim(), "unknown command");
            println!("unknown command: {}", line.trim());
        }
    }
    Flow::Continue
}
