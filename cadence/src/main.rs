use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use cadence::config::Config;
use cadence::core::{Block, Color, format_duration};
use cadence::store::BlockStore;
use chrono::{Duration, Local, NaiveDate, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use log::debug;

const DEFAULT_CONFIG_PATH: &str = "~/.config/cadence/config.toml";
const INSTANT_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"];

#[derive(Debug, Parser)]
#[command(
    name = "cadence",
    about = "Time-block scheduling over a folder of block files",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Settings file (TOML). Defaults to ~/.config/cadence/config.toml when it exists.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Block folder, overriding `save_path` from the settings.
    #[arg(long, global = true)]
    folder: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load every block file and verify the store invariants.
    Check,

    /// List the blocks of one day.
    Day(DayArgs),

    /// Create a block starting at an instant (or ending there, with --above).
    Place(PlaceArgs),

    /// Delete the block starting at an instant.
    Remove(AtArgs),

    /// Give a block a new title; its file is renamed to match.
    Rename(RenameArgs),

    /// Set a block's colour by name or index.
    Color(ColorArgs),

    ToggleImportant(AtArgs),

    ToggleCollapsible(AtArgs),

    /// Shift a block by minutes and/or whole days, keeping its length.
    Move(MoveArgs),

    /// Move a block's top or bottom edge one minute at a time.
    Resize(ResizeArgs),

    /// Duplicate a block below, above, or a number of days away.
    Copy(CopyArgs),

    /// Re-read a block file after editing it by hand.
    Reload(AtArgs),
}

#[derive(Debug, Args)]
struct AtArgs {
    /// Start of the block (YYYY-MM-DD HH:MM).
    #[arg(value_parser = parse_instant)]
    at: NaiveDateTime,
}

#[derive(Debug, Args)]
struct DayArgs {
    /// Day to list (YYYY-MM-DD). Defaults to today.
    date: Option<NaiveDate>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct PlaceArgs {
    /// Instant to place at (YYYY-MM-DD HH:MM).
    #[arg(value_parser = parse_instant)]
    at: NaiveDateTime,
    /// Treat the instant as the end of the new block.
    #[arg(long)]
    above: bool,
}

#[derive(Debug, Args)]
struct RenameArgs {
    #[arg(value_parser = parse_instant)]
    at: NaiveDateTime,
    title: String,
}

#[derive(Debug, Args)]
struct ColorArgs {
    #[arg(value_parser = parse_instant)]
    at: NaiveDateTime,
    /// white, red, green, yellow, blue, purple, aqua, gray, or 0-7.
    color: Color,
}

#[derive(Debug, Args)]
struct MoveArgs {
    #[arg(value_parser = parse_instant)]
    at: NaiveDateTime,
    /// Minutes to shift; negative moves earlier.
    #[arg(long, allow_hyphen_values = true, default_value_t = 0)]
    minutes: i64,
    /// Whole days to shift; negative moves to earlier days.
    #[arg(long, allow_hyphen_values = true, default_value_t = 0)]
    days: i64,
}

#[derive(Debug, Args)]
struct ResizeArgs {
    #[arg(value_parser = parse_instant)]
    at: NaiveDateTime,
    /// Minutes to move the top edge; negative grows the block upwards.
    #[arg(long, allow_hyphen_values = true, default_value_t = 0)]
    top: i64,
    /// Minutes to move the bottom edge; positive grows the block downwards.
    #[arg(long, allow_hyphen_values = true, default_value_t = 0)]
    bottom: i64,
}

#[derive(Debug, Args)]
struct CopyArgs {
    #[arg(value_parser = parse_instant)]
    at: NaiveDateTime,
    /// Place the copy directly after the block.
    #[arg(long, conflicts_with_all = ["above", "days"])]
    below: bool,
    /// Place the copy directly before the block.
    #[arg(long, conflicts_with = "days")]
    above: bool,
    /// Place the copy at the same time this many days away.
    #[arg(long, allow_hyphen_values = true)]
    days: Option<i64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(cli.config.as_deref(), cli.folder.as_deref())?;
    let folder = config.folder();
    let mut store = BlockStore::from_config(&config)
        .with_context(|| format!("loading blocks from {:?}", folder))?;
    debug!("opened {} block(s) in {:?}", store.len(), folder);

    match cli.command {
        Commands::Check => handle_check(&store),
        Commands::Day(args) => handle_day(&store, args),
        Commands::Place(args) => handle_place(&mut store, args),
        Commands::Remove(AtArgs { at }) => {
            report(store.remove_block(at)?, format!("removed block at {at}"))
        }
        Commands::Rename(RenameArgs { at, title }) => report(
            store.rename(at, &title)?,
            format!("renamed block at {at} to {title:?}"),
        ),
        Commands::Color(ColorArgs { at, color }) => report(
            store.set_color(at, color)?,
            format!("block at {at} is now {color}"),
        ),
        Commands::ToggleImportant(AtArgs { at }) => report(
            store.toggle_important(at)?,
            format!("toggled important on block at {at}"),
        ),
        Commands::ToggleCollapsible(AtArgs { at }) => report(
            store.toggle_collapsible(at)?,
            format!("toggled collapsible on block at {at}"),
        ),
        Commands::Move(args) => handle_move(&mut store, args),
        Commands::Resize(args) => handle_resize(&mut store, args),
        Commands::Copy(args) => handle_copy(&mut store, args),
        Commands::Reload(AtArgs { at }) => match store.reload_block(at)? {
            Some(start) => {
                println!("reloaded block, now starting at {start}");
                Ok(())
            }
            None => bail!("block at {at} was not reloaded; it is missing or collides with another block"),
        },
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load_config(path: Option<&Path>, folder: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading config {:?}", path))?
        }
        None => {
            let default = PathBuf::from(shellexpand::tilde(DEFAULT_CONFIG_PATH).as_ref());
            if default.is_file() {
                Config::load(&default).with_context(|| format!("loading config {:?}", default))?
            } else {
                Config::default()
            }
        }
    };
    Ok(match folder {
        Some(folder) => config.with_folder(folder),
        None => config,
    })
}

fn parse_instant(value: &str) -> Result<NaiveDateTime, String> {
    INSTANT_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value.trim(), format).ok())
        .ok_or_else(|| format!("{value:?} is not a YYYY-MM-DD HH:MM instant"))
}

fn report(done: bool, message: String) -> Result<()> {
    if !done {
        bail!("rejected, nothing changed: {message}");
    }
    println!("{message}");
    Ok(())
}

fn handle_check(store: &BlockStore) -> Result<()> {
    store.verify().context("store invariants")?;
    println!("{} block(s) in {:?} are consistent", store.len(), store.folder());
    Ok(())
}

fn handle_day(store: &BlockStore, args: DayArgs) -> Result<()> {
    let DayArgs { date, json } = args;
    let date = date.unwrap_or_else(|| Local::now().date_naive());
    let blocks = store.blocks_on_day(date);

    if json {
        println!("{}", serde_json::to_string_pretty(&blocks)?);
        return Ok(());
    }
    if blocks.is_empty() {
        eprintln!("No blocks on {date}.");
        return Ok(());
    }
    for block in &blocks {
        println!("{}", describe_block(block));
    }
    Ok(())
}

fn describe_block(block: &Block) -> String {
    let mut flags = String::new();
    if block.important() {
        flags.push('!');
    }
    if block.collapsible() {
        flags.push('~');
    }
    let link = if block.link().is_none() {
        String::new()
    } else {
        format!(" -> {}", block.link().raw())
    };
    format!(
        "{}-{} {:>5} {:<2} {} [{}]{}",
        block.start().format("%H:%M"),
        block.end().format("%H:%M"),
        format_duration(block.duration()),
        flags,
        block.title(),
        block.color(),
        link
    )
}

fn handle_place(store: &mut BlockStore, args: PlaceArgs) -> Result<()> {
    let PlaceArgs { at, above } = args;
    let placed = if above {
        store.place_above(at)?
    } else {
        store.place_below(at)?
    };
    if !placed {
        bail!("no free time at {at}");
    }
    let day = store.blocks_on_day(at.date());
    let block = day
        .iter()
        .find(|b| if above { b.end() == at } else { b.start() == at })
        .context("placed block is missing from the store")?;
    println!("placed {}", describe_block(block));
    Ok(())
}

fn handle_move(store: &mut BlockStore, args: MoveArgs) -> Result<()> {
    let MoveArgs { at, minutes, days } = args;
    if minutes == 0 && days == 0 {
        bail!("nothing to do: pass --minutes and/or --days");
    }
    let mut start = shift_minutes(store, at, minutes)?;
    if days != 0 {
        if !store.move_lateral(start, days)? {
            if start != at {
                bail!(
                    "the slot {days} day(s) from {start} is taken; the block was already moved \
                     from {at} and now starts at {start}"
                );
            }
            bail!("the slot {days} day(s) from {start} is taken");
        }
        start += Duration::days(days);
    }
    println!("block now starts at {start}");
    Ok(())
}

/// Move one minute at a time; stops at the first rejection. Minutes already
/// moved stay saved, and the error says where the block ended up.
fn shift_minutes(
    store: &mut BlockStore,
    mut start: NaiveDateTime,
    minutes: i64,
) -> Result<NaiveDateTime> {
    let step = Duration::minutes(minutes.signum());
    let total = minutes.unsigned_abs();
    for done in 0..total {
        let moved = if minutes < 0 {
            store.move_up(start)?
        } else {
            store.move_down(start)?
        };
        if !moved {
            bail!(
                "block moved {done} of {total} minute(s) and now starts at {start}; \
                 the next minute is not free"
            );
        }
        start += step;
    }
    Ok(start)
}

fn handle_resize(store: &mut BlockStore, args: ResizeArgs) -> Result<()> {
    let ResizeArgs { at, top, bottom } = args;
    if top == 0 && bottom == 0 {
        bail!("nothing to do: pass --top and/or --bottom");
    }
    let mut start = at;
    for _ in 0..top.unsigned_abs() {
        let (resized, next) = if top < 0 {
            (store.extend_top_up(start)?, start - Duration::minutes(1))
        } else {
            (store.extend_top_down(start)?, start + Duration::minutes(1))
        };
        if !resized {
            bail!("top edge stopped at {start}");
        }
        start = next;
    }
    for _ in 0..bottom.unsigned_abs() {
        let resized = if bottom < 0 {
            store.extend_bottom_up(start)?
        } else {
            store.extend_bottom_down(start)?
        };
        if !resized {
            bail!("bottom edge of the block at {start} cannot move further");
        }
    }
    let block = store
        .block_at(start)
        .context("resized block is missing from the store")?;
    println!("{}", describe_block(&block));
    Ok(())
}

fn handle_copy(store: &mut BlockStore, args: CopyArgs) -> Result<()> {
    let CopyArgs {
        at,
        below,
        above,
        days,
    } = args;
    let copied = match (below, above, days) {
        (true, _, _) => store.copy_vertical(at, true)?,
        (_, true, _) => store.copy_vertical(at, false)?,
        (_, _, Some(days)) => store.copy_lateral(at, days)?,
        _ => bail!("choose where to copy: --below, --above or --days"),
    };
    report(copied, format!("copied block at {at}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence::store::StoreOptions;
    use clap::CommandFactory;
    use std::fs;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_instant_accepts_space_and_t_separators() {
        assert_eq!(parse_instant("2024-06-01 09:30"), Ok(at(9, 30)));
        assert_eq!(parse_instant("2024-06-01T09:30"), Ok(at(9, 30)));
        assert!(parse_instant("09:30").is_err());
    }

    #[test]
    fn negative_offsets_parse_as_values() {
        let cli = Cli::try_parse_from([
            "cadence",
            "move",
            "2024-06-01 09:30",
            "--minutes",
            "-15",
            "--days",
            "-1",
        ])
        .expect("parse");
        match cli.command {
            Commands::Move(args) => {
                assert_eq!(args.minutes, -15);
                assert_eq!(args.days, -1);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn load_config_applies_folder_override() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("config.toml");
        fs::write(&path, "save_path = \"/elsewhere\"\n[time]\nday_start_hour = 8\n").unwrap();

        let config = load_config(Some(&path), Some(tmp.path())).expect("config");
        assert_eq!(config.folder(), tmp.path());
        assert_eq!(config.time.day_start_hour, 8);

        assert!(load_config(Some(&tmp.path().join("missing.toml")), None).is_err());
    }

    #[test]
    fn move_and_resize_step_minute_by_minute() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut store = BlockStore::open(tmp.path(), StoreOptions::default()).expect("open");
        handle_place(
            &mut store,
            PlaceArgs {
                at: at(9, 0),
                above: false,
            },
        )
        .expect("place");

        assert_eq!(shift_minutes(&mut store, at(9, 0), 15).unwrap(), at(9, 15));
        handle_resize(
            &mut store,
            ResizeArgs {
                at: at(9, 15),
                top: -5,
                bottom: -20,
            },
        )
        .expect("resize");
        let block = store.block_at(at(9, 10)).expect("resized block");
        assert_eq!(block.end(), at(9, 55));

        let err = shift_minutes(&mut store, at(9, 10), -300).unwrap_err();
        assert_eq!(
            err.to_string(),
            "block moved 190 of 300 minute(s) and now starts at 2024-06-01 06:00:00; \
             the next minute is not free"
        );
        assert_eq!(store.block_at(at(6, 0)).map(|b| b.end()), Some(at(6, 45)));
    }

    #[test]
    fn rejected_day_shift_reports_minutes_already_moved() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut store = BlockStore::open(tmp.path(), StoreOptions::default()).expect("open");
        let day_before = NaiveDate::from_ymd_opt(2024, 5, 31)
            .unwrap()
            .and_hms_opt(9, 5, 0)
            .unwrap();
        assert!(store.place_below(at(9, 0)).unwrap());
        assert!(store.place_below(day_before).unwrap());

        let err = handle_move(
            &mut store,
            MoveArgs {
                at: at(9, 0),
                minutes: 5,
                days: -1,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains(
            "already moved from 2024-06-01 09:00:00 and now starts at 2024-06-01 09:05:00"
        ));
        assert!(store.block_at(at(9, 5)).is_some());
    }
}
