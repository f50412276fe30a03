//! Time-block scheduling library.
//! Blocks live one-per-file in a folder; the store keeps them sorted by start,
//! refuses overlaps, and records every mutation so it can be undone.

pub mod core {
    use chrono::{Duration, NaiveDateTime, Timelike};
    use serde::{Deserialize, Serialize};
    use std::{
        fmt,
        path::{Path, PathBuf},
        str::FromStr,
    };

    pub const MAX_ID: u32 = 99_999;
    pub const MAX_GROUP: u32 = 99_999;
    pub const SECONDS_PER_MINUTE: i64 = 60;
    pub const SECONDS_PER_DAY: i64 = 86_400;

    /// Half-open `[start, end)` interval of wall-clock instants.
    pub type Interval = (NaiveDateTime, NaiveDateTime);

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BlockId(pub u32);

    impl fmt::Display for BlockId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// The eight display colours, in their on-disk index order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Color {
        #[default]
        White,
        Red,
        Green,
        Yellow,
        Blue,
        Purple,
        Aqua,
        Gray,
    }

    impl Color {
        pub const ALL: [Color; 8] = [
            Color::White,
            Color::Red,
            Color::Green,
            Color::Yellow,
            Color::Blue,
            Color::Purple,
            Color::Aqua,
            Color::Gray,
        ];

        pub fn index(self) -> u8 {
            self as u8
        }

        pub fn from_index(index: i64) -> Option<Self> {
            usize::try_from(index)
                .ok()
                .and_then(|i| Self::ALL.get(i).copied())
        }

        pub fn name(self) -> &'static str {
            match self {
                Color::White => "white",
                Color::Red => "red",
                Color::Green => "green",
                Color::Yellow => "yellow",
                Color::Blue => "blue",
                Color::Purple => "purple",
                Color::Aqua => "aqua",
                Color::Gray => "gray",
            }
        }

        /// Case-sensitive lookup of a symbolic name.
        pub fn from_name(name: &str) -> Option<Self> {
            Self::ALL.into_iter().find(|c| c.name() == name)
        }
    }

    impl fmt::Display for Color {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.name())
        }
    }

    impl FromStr for Color {
        type Err = DomainError;

        /// Accepts a symbolic name first, then an integer index.
        fn from_str(s: &str) -> Result<Self, Self::Err> {
            if let Some(color) = Self::from_name(s) {
                return Ok(color);
            }
            let index: i64 = s
                .parse()
                .map_err(|_| DomainError::UnknownColor(s.to_string()))?;
            Self::from_index(index).ok_or(DomainError::ColorOutOfRange(index))
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum LinkKind {
        None,
        File,
        Http,
        Task,
    }

    /// What a block points at. The variant is derived from the raw text.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "lowercase")]
    pub enum Link {
        #[default]
        None,
        /// A local file; `path` is the location that resolved (possibly `~`-expanded).
        File { raw: String, path: PathBuf },
        Http { url: String },
        /// Reference to another block by id.
        Task { id: i64 },
    }

    impl Link {
        /// Classify raw link text: empty, then integer, then an existing path
        /// (as written or `~`-expanded), and anything else is treated as a URL.
        pub fn classify(raw: &str) -> Self {
            let raw = raw.trim();
            if raw.is_empty() {
                return Link::None;
            }
            if let Ok(id) = raw.parse::<i64>() {
                return Link::Task { id };
            }
            let direct = Path::new(raw);
            if direct.exists() {
                return Link::File {
                    raw: raw.to_string(),
                    path: direct.to_path_buf(),
                };
            }
            let expanded = PathBuf::from(shellexpand::tilde(raw).as_ref());
            if expanded.exists() {
                return Link::File {
                    raw: raw.to_string(),
                    path: expanded,
                };
            }
            Link::Http {
                url: raw.to_string(),
            }
        }

        /// Text as it is written to the block file.
        pub fn raw(&self) -> String {
            match self {
                Link::None => String::new(),
                Link::File { raw, .. } => raw.clone(),
                Link::Http { url } => url.clone(),
                Link::Task { id } => id.to_string(),
            }
        }

        pub fn kind(&self) -> LinkKind {
            match self {
                Link::None => LinkKind::None,
                Link::File { .. } => LinkKind::File,
                Link::Http { .. } => LinkKind::Http,
                Link::Task { .. } => LinkKind::Task,
            }
        }

        pub fn is_none(&self) -> bool {
            matches!(self, Link::None)
        }
    }

    /* ---------------------------- Dirty tracking ---------------------------- */

    /// Fields whose on-disk copy can go stale.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Field {
        Id,
        Title,
        Link,
        Color,
        Collapsible,
        Important,
        Start,
        Duration,
    }

    impl Field {
        pub const ALL: [Field; 8] = [
            Field::Id,
            Field::Title,
            Field::Link,
            Field::Color,
            Field::Collapsible,
            Field::Important,
            Field::Start,
            Field::Duration,
        ];

        /// Fields stored in the metadata section, in emit order.
        pub const META: [Field; 4] = [
            Field::Color,
            Field::Link,
            Field::Collapsible,
            Field::Important,
        ];

        /// Fields stored in the time section, in emit order.
        pub const TIME: [Field; 2] = [Field::Start, Field::Duration];

        pub fn key(self) -> &'static str {
            match self {
                Field::Id => "id",
                Field::Title => "title",
                Field::Link => "link",
                Field::Color => "color",
                Field::Collapsible => "collapsible",
                Field::Important => "important",
                Field::Start => "start",
                Field::Duration => "duration",
            }
        }

        fn bit(self) -> u8 {
            1 << (self as u8)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirtyFields(u8);

    impl DirtyFields {
        pub fn all() -> Self {
            Self(u8::MAX)
        }

        pub fn mark(&mut self, field: Field) {
            self.0 |= field.bit();
        }

        pub fn clear(&mut self, field: Field) {
            self.0 &= !field.bit();
        }

        pub fn contains(self, field: Field) -> bool {
            self.0 & field.bit() != 0
        }

        pub fn is_empty(self) -> bool {
            self.0 == 0
        }

        pub fn iter(self) -> impl Iterator<Item = Field> {
            Field::ALL.into_iter().filter(move |f| self.contains(*f))
        }
    }

    /* ------------------------------- Block ------------------------------- */

    /// One scheduled interval. Setters mark the touched field dirty so the codec
    /// only rewrites what changed.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Block {
        pub(crate) id: BlockId,
        pub(crate) title: String,
        pub(crate) group: u32,
        pub(crate) color: Color,
        pub(crate) collapsible: bool,
        pub(crate) important: bool,
        pub(crate) link: Link,
        pub(crate) start: NaiveDateTime,
        /// Seconds.
        pub(crate) duration: i64,
        /// Backing file; `None` until the block is first saved.
        pub(crate) source: Option<PathBuf>,
        #[serde(skip)]
        pub(crate) dirty: DirtyFields,
    }

    impl Block {
        /// In-memory block with every field dirty, ready for its first save.
        pub fn new(id: BlockId, title: impl Into<String>, start: NaiveDateTime, duration: i64) -> Self {
            Self {
                id,
                title: title.into(),
                group: 0,
                color: Color::default(),
                collapsible: false,
                important: false,
                link: Link::None,
                start,
                duration,
                source: None,
                dirty: DirtyFields::all(),
            }
        }

        pub fn id(&self) -> BlockId {
            self.id
        }

        pub fn title(&self) -> &str {
            &self.title
        }

        pub fn group(&self) -> u32 {
            self.group
        }

        pub fn color(&self) -> Color {
            self.color
        }

        pub fn collapsible(&self) -> bool {
            self.collapsible
        }

        pub fn important(&self) -> bool {
            self.important
        }

        pub fn link(&self) -> &Link {
            &self.link
        }

        pub fn start(&self) -> NaiveDateTime {
            self.start
        }

        pub fn duration(&self) -> i64 {
            self.duration
        }

        pub fn end(&self) -> NaiveDateTime {
            self.start + Duration::seconds(self.duration)
        }

        pub fn interval(&self) -> Interval {
            (self.start, self.end())
        }

        pub fn source(&self) -> Option<&Path> {
            self.source.as_deref()
        }

        pub fn is_persisted(&self) -> bool {
            self.source.is_some()
        }

        pub fn dirty(&self) -> DirtyFields {
            self.dirty
        }

        pub fn set_id(&mut self, id: BlockId) {
            if self.id != id {
                self.id = id;
                self.dirty.mark(Field::Id);
            }
        }

        pub fn set_title(&mut self, title: impl Into<String>) {
            let title = title.into();
            if self.title != title {
                self.title = title;
                self.dirty.mark(Field::Title);
            }
        }

        pub fn set_link(&mut self, link: Link) {
            if self.link != link {
                self.link = link;
                self.dirty.mark(Field::Link);
            }
        }

        pub fn set_color(&mut self, color: Color) {
            if self.color != color {
                self.color = color;
                self.dirty.mark(Field::Color);
            }
        }

        pub fn set_collapsible(&mut self, collapsible: bool) {
            if self.collapsible != collapsible {
                self.collapsible = collapsible;
                self.dirty.mark(Field::Collapsible);
            }
        }

        pub fn set_important(&mut self, important: bool) {
            if self.important != important {
                self.important = important;
                self.dirty.mark(Field::Important);
            }
        }

        pub fn toggle_collapsible(&mut self) {
            self.set_collapsible(!self.collapsible);
        }

        pub fn toggle_important(&mut self) {
            self.set_important(!self.important);
        }

        pub fn set_start(&mut self, start: NaiveDateTime) {
            if self.start != start {
                self.start = start;
                self.dirty.mark(Field::Start);
            }
        }

        pub fn set_duration(&mut self, duration: i64) {
            if self.duration != duration {
                self.duration = duration;
                self.dirty.mark(Field::Duration);
            }
        }

        /// Set start and duration from an interval.
        pub fn set_interval(&mut self, (start, end): Interval) {
            self.set_start(start);
            self.set_duration((end - start).num_seconds());
        }

        pub fn mark_all_dirty(&mut self) {
            self.dirty = DirtyFields::all();
        }

        pub(crate) fn set_source(&mut self, path: Option<PathBuf>) {
            self.source = path;
        }

        pub(crate) fn clear_dirty(&mut self, fields: impl IntoIterator<Item = Field>) {
            for field in fields {
                self.dirty.clear(field);
            }
        }

        /// Copy every attribute of `snapshot` onto this block, keeping the
        /// current backing file. Only fields that differ become dirty.
        pub fn restore_from(&mut self, snapshot: &Block) {
            self.set_id(snapshot.id);
            self.set_title(snapshot.title.clone());
            self.group = snapshot.group;
            self.set_link(snapshot.link.clone());
            self.set_color(snapshot.color);
            self.set_collapsible(snapshot.collapsible);
            self.set_important(snapshot.important);
            self.set_start(snapshot.start);
            self.set_duration(snapshot.duration);
        }

        /// Same block apart from timing: id, title, link, group, flags, colour and
        /// calendar day all match.
        pub fn similar_to(&self, other: &Block) -> bool {
            self.id == other.id
                && self.title == other.title
                && self.link == other.link
                && self.group == other.group
                && self.color == other.color
                && self.collapsible == other.collapsible
                && self.important == other.important
                && self.start.date() == other.start.date()
        }

        /// Every stored field matches; the backing file and dirty flags are ignored.
        pub fn same_fields(&self, other: &Block) -> bool {
            self.similar_to(other) && self.start == other.start && self.duration == other.duration
        }

        pub fn validate(&self) -> Result<(), DomainError> {
            if self.title.is_empty() {
                return Err(DomainError::EmptyTitle);
            }
            if self.title.contains(['/', '\\']) {
                return Err(DomainError::TitleHasSeparator(self.title.clone()));
            }
            if self.start.second() != 0 || self.start.nanosecond() != 0 {
                return Err(DomainError::StartNotWholeMinute(self.start));
            }
            if self.duration <= 0
                || self.duration > SECONDS_PER_DAY
                || self.duration % SECONDS_PER_MINUTE != 0
            {
                return Err(DomainError::InvalidDuration(self.duration));
            }
            if self.id.0 == 0 || self.id.0 > MAX_ID {
                return Err(DomainError::IdOutOfRange(self.id.0));
            }
            if self.group > MAX_GROUP {
                return Err(DomainError::GroupOutOfRange(self.group));
            }
            if let Some(path) = &self.source {
                if !path.is_file() {
                    return Err(DomainError::MissingSource(path.clone()));
                }
            }
            Ok(())
        }
    }

    /// `H:MM` rendering of a duration in seconds.
    pub fn format_duration(seconds: i64) -> String {
        let minutes = seconds / SECONDS_PER_MINUTE;
        format!("{}:{:02}", minutes / 60, minutes % 60)
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("title is empty")]
        EmptyTitle,
        #[error("title {0:?} contains a path separator")]
        TitleHasSeparator(String),
        #[error("start time is not set")]
        MissingStart,
        #[error("start time {0} is not on a whole minute")]
        StartNotWholeMinute(NaiveDateTime),
        #[error("duration of {0}s is not a positive whole number of minutes up to one day")]
        InvalidDuration(i64),
        #[error("id {0} is out of range [1, 99999]")]
        IdOutOfRange(u32),
        #[error("group {0} is out of range [0, 99999]")]
        GroupOutOfRange(u32),
        #[error("color {0} is out of range [0, 7]")]
        ColorOutOfRange(i64),
        #[error("can't parse color {0:?} into a name or integer")]
        UnknownColor(String),
        #[error("source file {0:?} does not exist or is not a regular file")]
        MissingSource(PathBuf),
    }

}

pub mod config {
    //! Settings for the store and codec, read from a TOML file.
    //!
    //! Every key has a default, so a missing or empty file yields a usable config.

    use chrono::{
        Duration, NaiveDate, NaiveDateTime, NaiveTime,
        format::{Item, StrftimeItems},
    };
    use serde::Deserialize;
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    use crate::core::{SECONDS_PER_DAY, SECONDS_PER_MINUTE};

    pub const DEFAULT_START_FORMAT: &str = "%H:%M~%d.%m.%Y";
    pub const DEFAULT_EXTENSION: &str = "norg";
    const MINUTES_PER_DAY: u32 = 24 * 60;

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("unable to read config file {}: {source}", path.display())]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("error parsing config: {0}")]
        Parse(#[from] toml::de::Error),
        #[error("invalid config: {0}")]
        Invalid(String),
    }

    /// Time patterns used when reading and writing block files.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TimeFormats {
        start: String,
    }

    impl TimeFormats {
        /// `start` is a chrono strftime pattern; it must describe a full date and time.
        pub fn new(start: impl Into<String>) -> Result<Self, ConfigError> {
            let start = start.into();
            if start.is_empty() || StrftimeItems::new(&start).any(|item| matches!(item, Item::Error)) {
                return Err(ConfigError::Invalid(format!(
                    "time pattern {start:?} is not a valid strftime pattern"
                )));
            }
            Ok(Self { start })
        }

        pub fn start(&self) -> &str {
            &self.start
        }
    }

    impl Default for TimeFormats {
        fn default() -> Self {
            Self {
                start: DEFAULT_START_FORMAT.to_string(),
            }
        }
    }

    /// `[start, end)` offsets from local midnight, in minutes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DayWindow {
        start_minute: u32,
        end_minute: u32,
    }

    impl DayWindow {
        pub fn from_minutes(start_minute: u32, end_minute: u32) -> Result<Self, ConfigError> {
            if start_minute >= end_minute || end_minute > MINUTES_PER_DAY {
                return Err(ConfigError::Invalid(format!(
                    "day window {start_minute}..{end_minute} minutes must satisfy start < end <= 1440"
                )));
            }
            Ok(Self {
                start_minute,
                end_minute,
            })
        }

        /// `(hour, minute)` pairs; hours run to 24 and minutes to 59.
        pub fn from_hm(start: (u32, u32), end: (u32, u32)) -> Result<Self, ConfigError> {
            Self::from_minutes(minute_of_day(start)?, minute_of_day(end)?)
        }

        pub fn start_minute(&self) -> u32 {
            self.start_minute
        }

        pub fn end_minute(&self) -> u32 {
            self.end_minute
        }

        /// Absolute window for `date`.
        pub fn bounds(&self, date: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
            let midnight = date.and_time(NaiveTime::MIN);
            (
                midnight + Duration::minutes(i64::from(self.start_minute)),
                midnight + Duration::minutes(i64::from(self.end_minute)),
            )
        }
    }

    fn minute_of_day((hour, minute): (u32, u32)) -> Result<u32, ConfigError> {
        if hour > 24 || minute > 59 {
            return Err(ConfigError::Invalid(format!(
                "{hour}:{minute:02} is not a time of day"
            )));
        }
        Ok(hour * 60 + minute)
    }

    impl Default for DayWindow {
        fn default() -> Self {
            Self {
                start_minute: 6 * 60,
                end_minute: 22 * 60,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    #[serde(default)]
    pub struct Config {
        /// Folder holding the block files; `~` is expanded.
        pub save_path: String,
        pub extension: String,
        pub default_title: String,
        pub time: TimeConfig,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    #[serde(default)]
    pub struct TimeConfig {
        pub day_start_hour: u32,
        pub day_start_minute: u32,
        pub day_end_hour: u32,
        pub day_end_minute: u32,
        pub default_duration_minutes: u32,
        pub parse_format: String,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                save_path: "~/cadence".to_string(),
                extension: DEFAULT_EXTENSION.to_string(),
                default_title: "new block".to_string(),
                time: TimeConfig::default(),
            }
        }
    }

    impl Default for TimeConfig {
        fn default() -> Self {
            Self {
                day_start_hour: 6,
                day_start_minute: 0,
                day_end_hour: 22,
                day_end_minute: 0,
                default_duration_minutes: 60,
                parse_format: DEFAULT_START_FORMAT.to_string(),
            }
        }
    }

    impl Config {
        pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
            let config: Config = toml::from_str(text)?;
            config.validate()?;
            Ok(config)
        }

        pub fn load(path: &Path) -> Result<Self, ConfigError> {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_toml_str(&text)
        }

        pub fn validate(&self) -> Result<(), ConfigError> {
            if self.extension.is_empty() || self.extension.contains(['.', '/']) {
                return Err(ConfigError::Invalid(format!(
                    "extension {:?} must be a non-empty name without '.' or '/'",
                    self.extension
                )));
            }
            if self.default_title.is_empty() || self.default_title.contains(['/', '\\']) {
                return Err(ConfigError::Invalid(format!(
                    "default_title {:?} must be non-empty and free of path separators",
                    self.default_title
                )));
            }
            self.day_window()?;
            self.time_formats()?;
            let seconds = self.default_duration();
            if seconds <= 0 || seconds > SECONDS_PER_DAY {
                return Err(ConfigError::Invalid(format!(
                    "default_duration_minutes {} must be between 1 and 1440",
                    self.time.default_duration_minutes
                )));
            }
            Ok(())
        }

        pub fn folder(&self) -> PathBuf {
            PathBuf::from(shellexpand::tilde(&self.save_path).as_ref())
        }

        pub fn with_folder(mut self, folder: &Path) -> Self {
            self.save_path = folder.display().to_string();
            self
        }

        pub fn day_window(&self) -> Result<DayWindow, ConfigError> {
            let t = &self.time;
            DayWindow::from_hm(
                (t.day_start_hour, t.day_start_minute),
                (t.day_end_hour, t.day_end_minute),
            )
        }

        pub fn time_formats(&self) -> Result<TimeFormats, ConfigError> {
            TimeFormats::new(self.time.parse_format.clone())
        }

        /// Default block length in seconds.
        pub fn default_duration(&self) -> i64 {
            i64::from(self.time.default_duration_minutes) * SECONDS_PER_MINUTE
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn empty_file_uses_defaults() {
            let config = Config::from_toml_str("").expect("empty config");
            assert_eq!(config, Config::default());
            assert_eq!(config.default_duration(), 3600);
            assert_eq!(config.day_window().unwrap(), DayWindow::default());
        }

        #[test]
        fn partial_time_table_keeps_other_defaults() {
            let config = Config::from_toml_str(
                r#"
save_path = "/tmp/blocks"

[time]
day_start_hour = 7
day_start_minute = 30
"#,
            )
            .expect("config");
            assert_eq!(config.folder(), PathBuf::from("/tmp/blocks"));
            let window = config.day_window().unwrap();
            assert_eq!(window.start_minute(), 7 * 60 + 30);
            assert_eq!(window.end_minute(), 22 * 60);
        }

        #[test]
        fn rejects_inverted_window_and_bad_pattern() {
            let inverted = "[time]\nday_start_hour = 22\nday_end_hour = 6\n";
            assert!(matches!(
                Config::from_toml_str(inverted),
                Err(ConfigError::Invalid(_))
            ));

            let bad_pattern = "[time]\nparse_format = \"%Q\"\n";
            assert!(matches!(
                Config::from_toml_str(bad_pattern),
                Err(ConfigError::Invalid(_))
            ));

            assert!(matches!(
                Config::from_toml_str("extension = \"a.b\""),
                Err(ConfigError::Invalid(_))
            ));
        }

        #[test]
        fn out_of_range_hours_and_minutes_are_rejected() {
            assert!(matches!(
                Config::from_toml_str("[time]\nday_start_hour = 4294967295\n"),
                Err(ConfigError::Invalid(_))
            ));
            assert!(matches!(
                Config::from_toml_str("[time]\nday_start_minute = 90\n"),
                Err(ConfigError::Invalid(_))
            ));
            assert!(matches!(
                Config::from_toml_str("[time]\nday_end_hour = 24\nday_end_minute = 30\n"),
                Err(ConfigError::Invalid(_))
            ));
            assert!(DayWindow::from_hm((0, 0), (24, 0)).is_ok());
        }

        #[test]
        fn window_bounds_are_relative_to_midnight() {
            let window = DayWindow::from_hm((6, 0), (24, 0)).unwrap();
            let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
            let (start, end) = window.bounds(date);
            assert_eq!(start, date.and_hms_opt(6, 0, 0).unwrap());
            assert_eq!(
                end,
                NaiveDate::from_ymd_opt(2024, 6, 2)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
            );
        }
    }
}

pub mod parser {
    //! Block file decoding.
    //!
    //! A block file is named `<title>.<id>.<ext>` and its body holds two optional
    //! sections, each closed by `@end`:
    //! - `@document.meta` with `name: value` lines,
    //! - `@code lua time` with `name = value` lines.
    //!
    //! Anything outside a section is free text and is ignored here (the format
    //! module preserves it on save).

    use crate::config::TimeFormats;
    use crate::core::*;
    use chrono::NaiveDateTime;
    use nom::{
        IResult,
        bytes::complete::take_till,
        character::complete::{char, digit1},
        combinator::{all_consuming, map_res, rest},
        error::VerboseError,
        sequence::separated_pair,
    };
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    pub const META_MARKER: &str = "@document.meta";
    pub const TIME_MARKER: &str = "@code lua time";
    pub const END_MARKER: &str = "@end";

    #[derive(Debug, thiserror::Error)]
    pub enum CodecError {
        #[error("failed to parse filename {name:?}: {reason}")]
        Filename { name: String, reason: &'static str },
        #[error("error parsing {} @ line {line}, could not find '{delimiter}' delimiter", path.display())]
        MissingDelimiter {
            path: PathBuf,
            line: usize,
            delimiter: char,
        },
        #[error("error parsing {} @ line {line}, unrecognized field name: {name:?}", path.display())]
        UnknownField {
            path: PathBuf,
            line: usize,
            name: String,
        },
        #[error("error parsing {} @ line {line}, section {marker:?} is defined twice", path.display())]
        SectionTwice {
            path: PathBuf,
            line: usize,
            marker: &'static str,
        },
        #[error("error parsing {} @ line {line}, bad {field} value {value:?}: {reason}", path.display())]
        InvalidValue {
            path: PathBuf,
            line: usize,
            field: &'static str,
            value: String,
            reason: String,
        },
        #[error("in file {}, {source}", path.display())]
        Invalid {
            path: PathBuf,
            #[source]
            source: DomainError,
        },
        #[error("time pattern {pattern:?} cannot render {start}")]
        Render {
            pattern: String,
            start: NaiveDateTime,
        },
        #[error("unable to access block file {}: {source}", path.display())]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
    }

    impl CodecError {
        pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> CodecError + '_ {
            move |source| CodecError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// Reads and writes block files. Owns the time pattern and file extension so
    /// nothing about the on-disk format is global.
    #[derive(Debug, Clone)]
    pub struct BlockCodec {
        formats: TimeFormats,
        extension: String,
    }

    impl BlockCodec {
        pub fn new(formats: TimeFormats, extension: impl Into<String>) -> Self {
            Self {
                formats,
                extension: extension.into(),
            }
        }

        pub fn formats(&self) -> &TimeFormats {
            &self.formats
        }

        pub fn extension(&self) -> &str {
            &self.extension
        }

        pub fn file_name(&self, title: &str, id: BlockId) -> String {
            format!("{title}.{id}.{}", self.extension)
        }

        /// Read, decode and validate the block stored at `path`.
        pub fn decode_file(&self, path: &Path) -> Result<Block, CodecError> {
            let text = fs::read_to_string(path).map_err(CodecError::io(path))?;
            let block = self.decode_str(path, &text)?;
            block.validate().map_err(|source| CodecError::Invalid {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(block)
        }

        /// Decode `text` as though it were the contents of `path`. The returned
        /// block records `path` as its source but the file itself is not checked.
        pub fn decode_str(&self, path: &Path, text: &str) -> Result<Block, CodecError> {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| CodecError::Filename {
                    name: path.display().to_string(),
                    reason: "not valid UTF-8",
                })?;
            let (title, id) = parse_file_name(name)?;
            let draft = scan_body(path, text, &self.formats)?;
            let invalid = |source: DomainError| CodecError::Invalid {
                path: path.to_path_buf(),
                source,
            };

            let start = draft.start.ok_or_else(|| invalid(DomainError::MissingStart))?;
            let block = Block {
                id,
                title,
                group: draft.group,
                color: draft.color,
                collapsible: draft.collapsible,
                important: draft.important,
                link: draft.link,
                start,
                duration: draft.duration.unwrap_or(0),
                source: None,
                dirty: DirtyFields::default(),
            };
            block.validate().map_err(invalid)?;
            Ok(Block {
                source: Some(path.to_path_buf()),
                ..block
            })
        }
    }

    /// Split `<title>.<id>.<ext>` into title and id. The extension is dropped
    /// first, then the stem is split at its last `.` so titles may contain dots.
    pub fn parse_file_name(name: &str) -> Result<(String, BlockId), CodecError> {
        let stem = Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name);
        let (title, id) = stem.rsplit_once('.').ok_or_else(|| CodecError::Filename {
            name: name.to_string(),
            reason: "there should be a '.' between the title and id",
        })?;
        let id = id.parse::<u32>().map_err(|_| CodecError::Filename {
            name: name.to_string(),
            reason: "the id is not an integer",
        })?;
        Ok((title.to_string(), BlockId(id)))
    }

    /// `H:MM` to seconds. Minutes are not capped at 59.
    pub fn parse_duration(value: &str) -> Result<i64, String> {
        if !value.contains(':') {
            return Err("expected H:MM".to_string());
        }
        let (_, (hours, minutes)) = duration_hm(value)
            .map_err(|_| "hours and minutes must be non-negative integers".to_string())?;
        hours
            .checked_mul(3600)
            .zip(minutes.checked_mul(60))
            .and_then(|(h, m)| h.checked_add(m))
            .and_then(|s| i64::try_from(s).ok())
            .ok_or_else(|| "duration is too large".to_string())
    }

    /* ------------------------------ Scanner ------------------------------ */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum ScanState {
        Outside,
        InMeta,
        InTime,
    }

    #[derive(Debug, Default)]
    struct Draft {
        link: Link,
        group: u32,
        color: Color,
        collapsible: bool,
        important: bool,
        start: Option<NaiveDateTime>,
        duration: Option<i64>,
    }

    fn scan_body(path: &Path, text: &str, formats: &TimeFormats) -> Result<Draft, CodecError> {
        let mut draft = Draft::default();
        let mut state = ScanState::Outside;
        let (mut seen_meta, mut seen_time) = (false, false);

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            match state {
                ScanState::Outside => {
                    let (seen, marker, next) = match line {
                        META_MARKER => (&mut seen_meta, META_MARKER, ScanState::InMeta),
                        TIME_MARKER => (&mut seen_time, TIME_MARKER, ScanState::InTime),
                        _ => continue,
                    };
                    if *seen {
                        return Err(CodecError::SectionTwice {
                            path: path.to_path_buf(),
                            line: line_no,
                            marker,
                        });
                    }
                    *seen = true;
                    state = next;
                }
                ScanState::InMeta | ScanState::InTime => {
                    if line == END_MARKER {
                        state = ScanState::Outside;
                        continue;
                    }
                    let delimiter = if state == ScanState::InMeta { ':' } else { '=' };
                    let (_, (name, value)) =
                        field_line(line, delimiter).map_err(|_| CodecError::MissingDelimiter {
                            path: path.to_path_buf(),
                            line: line_no,
                            delimiter,
                        })?;
                    let (name, value) = (name.trim(), value.trim());
                    let at = FieldSite { path, line: line_no };
                    if state == ScanState::InMeta {
                        apply_meta_field(&mut draft, name, value, at)?;
                    } else {
                        apply_time_field(&mut draft, name, value, formats, at)?;
                    }
                }
            }
        }

        Ok(draft)
    }

    #[derive(Clone, Copy)]
    struct FieldSite<'a> {
        path: &'a Path,
        line: usize,
    }

    impl FieldSite<'_> {
        fn invalid(self, field: &'static str, value: &str, reason: impl ToString) -> CodecError {
            CodecError::InvalidValue {
                path: self.path.to_path_buf(),
                line: self.line,
                field,
                value: value.to_string(),
                reason: reason.to_string(),
            }
        }

        fn unknown(self, name: &str) -> CodecError {
            CodecError::UnknownField {
                path: self.path.to_path_buf(),
                line: self.line,
                name: name.to_string(),
            }
        }
    }

    fn apply_meta_field(
        draft: &mut Draft,
        name: &str,
        value: &str,
        at: FieldSite<'_>,
    ) -> Result<(), CodecError> {
        match name {
            "collapsible" => draft.collapsible = true,
            "important" => draft.important = true,
            "link" => draft.link = Link::classify(value),
            "group" => {
                draft.group = value
                    .parse()
                    .map_err(|e| at.invalid("group", value, e))?;
            }
            "color" => {
                draft.color = value.parse().map_err(|e| at.invalid("color", value, e))?;
            }
            other => return Err(at.unknown(other)),
        }
        Ok(())
    }

    fn apply_time_field(
        draft: &mut Draft,
        name: &str,
        value: &str,
        formats: &TimeFormats,
        at: FieldSite<'_>,
    ) -> Result<(), CodecError> {
        match name {
            "start" => {
                let start = NaiveDateTime::parse_from_str(value, formats.start())
                    .map_err(|e| at.invalid("start", value, e))?;
                draft.start = Some(start);
            }
            "duration" => {
                let seconds = parse_duration(value).map_err(|e| at.invalid("duration", value, e))?;
                draft.duration = Some(seconds);
            }
            other => return Err(at.unknown(other)),
        }
        Ok(())
    }

    fn field_line(line: &str, delimiter: char) -> PResult<'_, (&str, &str)> {
        separated_pair(take_till(move |c| c == delimiter), char(delimiter), rest)(line)
    }

    fn duration_hm(i: &str) -> PResult<'_, (u64, u64)> {
        all_consuming(separated_pair(
            map_res(digit1, str::parse::<u64>),
            char(':'),
            map_res(digit1, str::parse::<u64>),
        ))(i)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        fn codec() -> BlockCodec {
            BlockCodec::new(TimeFormats::default(), "norg")
        }

        fn decode(name: &str, text: &str) -> Result<Block, CodecError> {
            codec().decode_str(Path::new(name), text)
        }

        #[test]
        fn decodes_start_and_duration() {
            let text = "@document.meta\n@end\n\n@code lua time\nstart = 9:30~01.06.2024\nduration = 1:30\n@end\n";
            let block = decode("Deep work.123.norg", text).expect("decode");
            let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
            assert_eq!(block.id(), BlockId(123));
            assert_eq!(block.title(), "Deep work");
            assert_eq!(block.start(), day.and_hms_opt(9, 30, 0).unwrap());
            assert_eq!(block.end(), day.and_hms_opt(11, 0, 0).unwrap());
            assert_eq!(block.duration(), 5400);
            assert!(block.dirty().is_empty());
        }

        #[test]
        fn decodes_metadata_fields() {
            let text = "\
Some notes that live outside the sections.

@document.meta
  color: purple
  link: 1234
  group: 17
  collapsible:
  important:
@end
@code lua time
start = 06:00~02.06.2024
duration = 0:45
@end
";
            let block = decode("Call mum.5.norg", text).expect("decode");
            assert_eq!(block.color(), Color::Purple);
            assert_eq!(block.link(), &Link::Task { id: 1234 });
            assert_eq!(block.group(), 17);
            assert!(block.collapsible());
            assert!(block.important());
            assert_eq!(block.duration(), 45 * 60);
        }

        #[test]
        fn absent_flags_default_to_false() {
            let text = "@code lua time\nstart = 06:00~02.06.2024\nduration = 1:00\n@end\n";
            let block = decode("Plain.9.norg", text).expect("decode");
            assert!(!block.collapsible());
            assert!(!block.important());
            assert_eq!(block.color(), Color::White);
            assert!(block.link().is_none());
        }

        #[test]
        fn numeric_color_is_accepted() {
            let text = "@document.meta\ncolor: 4\n@end\n@code lua time\nstart = 06:00~02.06.2024\nduration = 1:00\n@end\n";
            assert_eq!(decode("C.1.norg", text).unwrap().color(), Color::Blue);
        }

        #[test]
        fn filename_errors() {
            assert!(matches!(
                parse_file_name("notitle.norg"),
                Err(CodecError::Filename { .. })
            ));
            assert!(matches!(
                parse_file_name("title.abc.norg"),
                Err(CodecError::Filename { .. })
            ));
            assert_eq!(
                parse_file_name("v1.2 release.42.norg").unwrap(),
                ("v1.2 release".to_string(), BlockId(42))
            );
        }

        #[test]
        fn unknown_field_reports_line() {
            let text = "@document.meta\n\ncolour: red\n@end\n";
            match decode("X.1.norg", text) {
                Err(CodecError::UnknownField { line, name, .. }) => {
                    assert_eq!(line, 3);
                    assert_eq!(name, "colour");
                }
                other => panic!("expected unknown field, got {other:?}"),
            }
        }

        #[test]
        fn section_opened_twice_is_rejected() {
            let text = "@document.meta\n@end\n@document.meta\n@end\n";
            assert!(matches!(
                decode("X.1.norg", text),
                Err(CodecError::SectionTwice { line: 3, .. })
            ));
        }

        #[test]
        fn time_section_needs_equals() {
            let text = "@code lua time\nstart: 06:00~02.06.2024\n@end\n";
            assert!(matches!(
                decode("X.1.norg", text),
                Err(CodecError::MissingDelimiter {
                    line: 2,
                    delimiter: '=',
                    ..
                })
            ));
        }

        #[test]
        fn bad_values_are_errors() {
            let no_colon = "@code lua time\nstart = 06:00~02.06.2024\nduration = 90\n@end\n";
            assert!(matches!(
                decode("X.1.norg", no_colon),
                Err(CodecError::InvalidValue {
                    field: "duration",
                    ..
                })
            ));

            let bad_color = "@document.meta\ncolor: mauve\n@end\n";
            assert!(matches!(
                decode("X.1.norg", bad_color),
                Err(CodecError::InvalidValue { field: "color", .. })
            ));

            let bad_start = "@code lua time\nstart = tomorrow\n@end\n";
            assert!(matches!(
                decode("X.1.norg", bad_start),
                Err(CodecError::InvalidValue { field: "start", .. })
            ));
        }

        #[test]
        fn unterminated_section_is_caught_by_validation() {
            let text = "@code lua time\nduration = 1:00\n";
            assert!(matches!(
                decode("X.1.norg", text),
                Err(CodecError::Invalid {
                    source: DomainError::MissingStart,
                    ..
                })
            ));

            let zero = "@code lua time\nstart = 06:00~02.06.2024\nduration = 0:00\n";
            assert!(matches!(
                decode("X.1.norg", zero),
                Err(CodecError::Invalid {
                    source: DomainError::InvalidDuration(0),
                    ..
                })
            ));
        }

        #[test]
        fn duration_parsing() {
            assert_eq!(parse_duration("1:30"), Ok(5400));
            assert_eq!(parse_duration("0:90"), Ok(5400));
            assert!(parse_duration("1:-5").is_err());
            assert!(parse_duration("1:30:00").is_err());
            assert!(parse_duration("130").is_err());
        }

        #[test]
        fn decode_file_checks_source() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("Run.77.norg");
            fs::write(
                &path,
                "@code lua time\nstart = 07:00~03.06.2024\nduration = 0:30\n@end\n",
            )
            .expect("write");
            let block = codec().decode_file(&path).expect("decode");
            assert_eq!(block.source(), Some(path.as_path()));
            assert_eq!(block.duration(), 1800);
        }
    }
}

pub mod format {
    //! Incremental block file writer.
    //!
    //! A save only touches what the dirty flags name. The file is renamed when
    //! the title changes, or copied when the id changes (a duplicate keeps the
    //! original file), and inside each section only the lines of dirty fields
    //! are replaced. Every other line is left byte for byte.

    use crate::core::*;
    use crate::parser::{BlockCodec, CodecError, END_MARKER, META_MARKER, TIME_MARKER};
    use log::{debug, warn};
    use std::{
        ffi::OsStr,
        fmt::Write as _,
        fs,
        io::{self, Write as _},
        path::{Path, PathBuf},
    };

    const SKELETON: &str = "@document.meta\n@end\n\n@code lua time\n@end\n";

    /// How `save` obtained the file it writes into, so a failed write can be undone.
    enum Placement {
        Existing,
        Created,
        Copied,
        Renamed { from: PathBuf },
    }

    impl BlockCodec {
        /// Flush the dirty fields of `block` to disk. Never-saved blocks get a new
        /// file in `folder`. On error the block and the folder are left as they were.
        pub fn save(&self, block: &mut Block, folder: &Path) -> Result<(), CodecError> {
            let dirty = block.dirty();
            if dirty.is_empty() && block.is_persisted() {
                return Ok(());
            }

            let name = self.file_name(block.title(), block.id());
            let (path, placement) = match block.source() {
                None => {
                    let path = folder.join(&name);
                    create_new(&path, SKELETON)?;
                    (path, Placement::Created)
                }
                Some(current) if dirty.contains(Field::Id) => {
                    let path = current.with_file_name(&name);
                    ensure_vacant(&path)?;
                    fs::copy(current, &path).map_err(CodecError::io(&path))?;
                    (path, Placement::Copied)
                }
                Some(current) if dirty.contains(Field::Title) && current.file_name() != Some(OsStr::new(&name)) => {
                    let path = current.with_file_name(&name);
                    ensure_vacant(&path)?;
                    fs::rename(current, &path).map_err(CodecError::io(current))?;
                    (
                        path,
                        Placement::Renamed {
                            from: current.to_path_buf(),
                        },
                    )
                }
                Some(current) => (current.to_path_buf(), Placement::Existing),
            };

            let flushed = match self.rewrite_fields(block, &path, dirty) {
                Ok(flushed) => flushed,
                Err(err) => {
                    roll_back(&path, placement);
                    return Err(err);
                }
            };

            block.set_source(Some(path));
            block.clear_dirty([Field::Id, Field::Title]);
            block.clear_dirty(flushed);
            Ok(())
        }

        /// Remove the backing file, returning its text so the deletion can be undone.
        pub fn delete(&self, block: &Block) -> Result<Option<String>, CodecError> {
            let Some(path) = block.source() else {
                return Ok(None);
            };
            let contents = fs::read_to_string(path).map_err(CodecError::io(path))?;
            fs::remove_file(path).map_err(CodecError::io(path))?;
            debug!("removed block file {}", path.display());
            Ok(Some(contents))
        }

        /// Recreate a deleted block's file from the text `delete` returned.
        pub fn restore(&self, block: &Block, contents: &str) -> Result<(), CodecError> {
            match block.source() {
                Some(path) => create_new(path, contents),
                None => Ok(()),
            }
        }

        fn rewrite_fields(
            &self,
            block: &Block,
            path: &Path,
            dirty: DirtyFields,
        ) -> Result<Vec<Field>, CodecError> {
            let meta: Vec<Field> = Field::META
                .into_iter()
                .filter(|f| dirty.contains(*f))
                .collect();
            let time: Vec<Field> = Field::TIME
                .into_iter()
                .filter(|f| dirty.contains(*f))
                .collect();
            if meta.is_empty() && time.is_empty() {
                return Ok(Vec::new());
            }

            let text = fs::read_to_string(path).map_err(CodecError::io(path))?;
            let mut lines: Vec<String> = text.split('\n').map(String::from).collect();
            if !meta.is_empty() {
                let emitted = meta_lines(block, &meta);
                rewrite_section(&mut lines, META_MARKER, ':', &meta, emitted);
            }
            if !time.is_empty() {
                let emitted = self.time_lines(block, &time)?;
                rewrite_section(&mut lines, TIME_MARKER, '=', &time, emitted);
            }
            fs::write(path, lines.join("\n")).map_err(CodecError::io(path))?;

            debug!(
                "wrote {} field(s) of block {} to {}",
                meta.len() + time.len(),
                block.id(),
                path.display()
            );
            Ok(meta.into_iter().chain(time).collect())
        }

        fn time_lines(&self, block: &Block, fields: &[Field]) -> Result<Vec<String>, CodecError> {
            let mut out = Vec::new();
            for field in fields {
                match field {
                    Field::Start => {
                        let mut line = String::from("start = ");
                        write!(line, "{}", block.start().format(self.formats().start())).map_err(
                            |_| CodecError::Render {
                                pattern: self.formats().start().to_string(),
                                start: block.start(),
                            },
                        )?;
                        out.push(line);
                    }
                    Field::Duration => {
                        out.push(format!("duration = {}", format_duration(block.duration())))
                    }
                    _ => {}
                }
            }
            Ok(out)
        }
    }

    /// Lines for dirty metadata fields. Flags are written only when set and the
    /// link only when present; a removed line is how `false`/empty is stored.
    fn meta_lines(block: &Block, fields: &[Field]) -> Vec<String> {
        let mut out = Vec::new();
        for field in fields {
            match field {
                Field::Color => out.push(format!("color: {}", block.color())),
                Field::Link if !block.link().is_none() => {
                    out.push(format!("link: {}", block.link().raw()))
                }
                Field::Collapsible if block.collapsible() => out.push("collapsible:".to_string()),
                Field::Important if block.important() => out.push("important:".to_string()),
                _ => {}
            }
        }
        out
    }

    /// Drop the section's lines for `fields` and insert `emitted` just before its
    /// `@end`. A missing section is appended to the file.
    fn rewrite_section(
        lines: &mut Vec<String>,
        marker: &str,
        delimiter: char,
        fields: &[Field],
        emitted: Vec<String>,
    ) {
        let Some(open) = lines.iter().position(|l| l.trim() == marker) else {
            append_section(lines, marker, emitted);
            return;
        };

        let mut i = open + 1;
        while i < lines.len() && lines[i].trim() != END_MARKER {
            let owned = lines[i]
                .split_once(delimiter)
                .is_some_and(|(name, _)| fields.iter().any(|f| f.key() == name.trim()));
            if owned {
                lines.remove(i);
            } else {
                i += 1;
            }
        }

        if i == lines.len() {
            // unterminated: keep trailing blank lines after the new fields
            while i > open + 1 && lines[i - 1].trim().is_empty() {
                i -= 1;
            }
        }
        lines.splice(i..i, emitted);
    }

    fn append_section(lines: &mut Vec<String>, marker: &str, body: Vec<String>) {
        if lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        if lines.iter().any(|l| !l.trim().is_empty()) {
            lines.push(String::new());
        }
        lines.push(marker.to_string());
        lines.extend(body);
        lines.push(END_MARKER.to_string());
        lines.push(String::new());
    }

    fn ensure_vacant(path: &Path) -> Result<(), CodecError> {
        if path.exists() {
            return Err(CodecError::Io {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::AlreadyExists, "file already exists"),
            });
        }
        Ok(())
    }

    fn create_new(path: &Path, contents: &str) -> Result<(), CodecError> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(CodecError::io(path))?;
        if let Err(source) = file.write_all(contents.as_bytes()) {
            drop(file);
            let _ = fs::remove_file(path);
            return Err(CodecError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
        Ok(())
    }

    fn roll_back(path: &Path, placement: Placement) {
        let result = match placement {
            Placement::Existing => Ok(()),
            Placement::Created | Placement::Copied => fs::remove_file(path),
            Placement::Renamed { from } => fs::rename(path, from),
        };
        if let Err(err) = result {
            warn!("could not roll back {}: {err}", path.display());
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::config::TimeFormats;
        use chrono::{NaiveDate, NaiveDateTime};

        fn codec() -> BlockCodec {
            BlockCodec::new(TimeFormats::default(), "norg")
        }

        fn at(h: u32, m: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2024, 6, 1)
                .unwrap()
                .and_hms_opt(h, m, 0)
                .unwrap()
        }

        #[test]
        fn first_save_materializes_skeleton() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut block = Block::new(BlockId(12), "Stretch", at(6, 0), 3600);
            codec().save(&mut block, tmp.path()).expect("save");

            let path = tmp.path().join("Stretch.12.norg");
            assert_eq!(block.source(), Some(path.as_path()));
            assert!(block.dirty().is_empty());
            assert_eq!(
                fs::read_to_string(&path).unwrap(),
                "@document.meta\ncolor: white\n@end\n\n@code lua time\nstart = 06:00~01.06.2024\nduration = 1:00\n@end\n"
            );

            let decoded = codec().decode_file(&path).expect("decode");
            assert!(decoded.same_fields(&block));
        }

        #[test]
        fn only_dirty_lines_are_rewritten() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("Review.3.norg");
            let original = "\
* keep this heading
@document.meta
  group: 4
  color: red
  link: https://example.com
@end

free text between sections

@code lua time
start = 10:00~01.06.2024
duration = 0:30
@end
trailing notes";
            fs::write(&path, original).unwrap();

            let mut block = codec().decode_file(&path).expect("decode");
            block.toggle_important();
            block.set_color(Color::Green);
            codec().save(&mut block, tmp.path()).expect("save");

            let expected = "\
* keep this heading
@document.meta
  group: 4
  link: https://example.com
color: green
important:
@end

free text between sections

@code lua time
start = 10:00~01.06.2024
duration = 0:30
@end
trailing notes";
            assert_eq!(fs::read_to_string(&path).unwrap(), expected);
            assert!(block.dirty().is_empty());

            block.toggle_important();
            codec().save(&mut block, tmp.path()).expect("save again");
            let reread = codec().decode_file(&path).expect("decode");
            assert!(!reread.important());
            assert_eq!(reread.group(), 4);
            assert!(reread.same_fields(&block));
        }

        #[test]
        fn title_change_renames_file() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut block = Block::new(BlockId(8), "Draft", at(9, 0), 1800);
            codec().save(&mut block, tmp.path()).expect("save");
            let old = block.source().unwrap().to_path_buf();

            block.set_title("Final");
            codec().save(&mut block, tmp.path()).expect("rename");
            assert!(!old.exists());
            assert!(tmp.path().join("Final.8.norg").is_file());
            assert!(block.dirty().is_empty());
        }

        #[test]
        fn id_change_copies_and_keeps_original() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut block = Block::new(BlockId(8), "Lunch", at(12, 0), 3600);
            codec().save(&mut block, tmp.path()).expect("save");
            let original = block.source().unwrap().to_path_buf();

            let mut copy = block.clone();
            copy.set_id(BlockId(9));
            copy.set_start(at(13, 0));
            codec().save(&mut copy, tmp.path()).expect("copy");

            assert!(original.is_file());
            let copied = codec()
                .decode_file(&tmp.path().join("Lunch.9.norg"))
                .expect("decode copy");
            assert_eq!(copied.start(), at(13, 0));
            let first = codec().decode_file(&original).expect("decode original");
            assert_eq!(first.start(), at(12, 0));
        }

        #[test]
        fn missing_section_is_appended() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("Bare.4.norg");
            fs::write(
                &path,
                "@code lua time\nstart = 08:00~01.06.2024\nduration = 1:00\n@end\n",
            )
            .unwrap();

            let mut block = codec().decode_file(&path).expect("decode");
            block.set_color(Color::Blue);
            codec().save(&mut block, tmp.path()).expect("save");
            assert_eq!(
                fs::read_to_string(&path).unwrap(),
                "@code lua time\nstart = 08:00~01.06.2024\nduration = 1:00\n@end\n\n@document.meta\ncolor: blue\n@end\n"
            );
        }

        #[test]
        fn rename_onto_existing_file_fails_cleanly() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut a = Block::new(BlockId(1), "A", at(6, 0), 3600);
            codec().save(&mut a, tmp.path()).expect("save a");
            fs::write(tmp.path().join("B.1.norg"), "occupied").unwrap();

            a.set_title("B");
            let err = codec().save(&mut a, tmp.path()).unwrap_err();
            assert!(matches!(err, CodecError::Io { .. }));
            assert!(tmp.path().join("A.1.norg").is_file());
            assert!(a.dirty().contains(Field::Title));
            assert_eq!(
                fs::read_to_string(tmp.path().join("B.1.norg")).unwrap(),
                "occupied"
            );
        }

        #[test]
        fn link_round_trips_including_colons() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut block = Block::new(BlockId(21), "Standup", at(9, 0), 900);
            block.set_link(Link::classify("https://meet.example.com:8443/room?id=a:b"));
            codec().save(&mut block, tmp.path()).expect("save");
            let path = block.source().unwrap().to_path_buf();

            let decoded = codec().decode_file(&path).expect("decode");
            assert_eq!(decoded.link(), block.link());
            assert_eq!(decoded.link().kind(), LinkKind::Http);

            block.set_link(Link::classify("314"));
            codec().save(&mut block, tmp.path()).expect("save task link");
            let decoded = codec().decode_file(&path).expect("decode");
            assert_eq!(decoded.link(), &Link::Task { id: 314 });

            block.set_link(Link::None);
            codec().save(&mut block, tmp.path()).expect("clear link");
            assert!(!fs::read_to_string(&path).unwrap().contains("link:"));
            assert!(codec().decode_file(&path).expect("decode").link().is_none());
        }

        #[test]
        fn delete_then_restore_is_byte_identical() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("Keep.2.norg");
            let text = "notes\n@code lua time\nstart = 08:00~01.06.2024\nduration = 1:00\n@end\n";
            fs::write(&path, text).unwrap();
            let block = codec().decode_file(&path).expect("decode");

            let contents = codec().delete(&block).expect("delete");
            assert!(!path.exists());
            codec()
                .restore(&block, contents.as_deref().unwrap())
                .expect("restore");
            assert_eq!(fs::read_to_string(&path).unwrap(), text);
        }
    }
}

pub mod history {
    //! Undo/redo log. Entries hold block ids and value snapshots, never
    //! positions in the store's sequence.

    use crate::core::{Block, BlockId};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Action {
        /// Attributes of an existing block changed; `before` is the prior value.
        /// `resize` marks per-minute edge edits, which coalesce.
        Modify { before: Block, resize: bool },
        /// A block was added; undoing removes it again.
        Create { id: BlockId },
        /// A block was removed. `contents` is the file text at removal time.
        Delete {
            before: Block,
            contents: Option<String>,
        },
    }

    impl Action {
        pub fn id(&self) -> BlockId {
            match self {
                Action::Modify { before, .. } | Action::Delete { before, .. } => before.id(),
                Action::Create { id } => *id,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Direction {
        Undo,
        Redo,
    }

    impl Direction {
        pub fn opposite(self) -> Self {
            match self {
                Direction::Undo => Direction::Redo,
                Direction::Redo => Direction::Undo,
            }
        }
    }

    #[derive(Debug, Default)]
    pub struct History {
        undo: Vec<Action>,
        redo: Vec<Action>,
    }

    impl History {
        pub fn new() -> Self {
            Self::default()
        }

        /// Log a fresh mutation. Anything left to redo is stale after this.
        pub fn record(&mut self, action: Action) {
            self.redo.clear();
            self.undo.push(action);
        }

        /// Log a one-minute edge edit. A run of edits to the same block keeps
        /// only the snapshot taken before the run started.
        pub fn record_resize(&mut self, before: Block) {
            self.redo.clear();
            if let Some(Action::Modify { before: top, resize: true }) = self.undo.last() {
                if top.similar_to(&before) {
                    return;
                }
            }
            self.undo.push(Action::Modify {
                before,
                resize: true,
            });
        }

        pub fn take(&mut self, direction: Direction) -> Option<Action> {
            self.stack(direction).pop()
        }

        /// Push without touching the other stack; used while undoing and redoing.
        pub fn give(&mut self, direction: Direction, action: Action) {
            self.stack(direction).push(action);
        }

        pub fn can_undo(&self) -> bool {
            !self.undo.is_empty()
        }

        pub fn can_redo(&self) -> bool {
            !self.redo.is_empty()
        }

        pub fn clear(&mut self) {
            self.undo.clear();
            self.redo.clear();
        }

        fn stack(&mut self, direction: Direction) -> &mut Vec<Action> {
            match direction {
                Direction::Undo => &mut self.undo,
                Direction::Redo => &mut self.redo,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::Color;
        use chrono::{NaiveDate, NaiveDateTime};

        fn at(h: u32, m: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2024, 6, 1)
                .unwrap()
                .and_hms_opt(h, m, 0)
                .unwrap()
        }

        fn block(id: u32, h: u32) -> Block {
            Block::new(BlockId(id), "task", at(h, 0), 3600)
        }

        #[test]
        fn record_clears_redo() {
            let mut history = History::new();
            history.record(Action::Create { id: BlockId(1) });
            let action = history.take(Direction::Undo).expect("entry");
            history.give(Direction::Redo, action);
            assert!(history.can_redo());

            history.record(Action::Create { id: BlockId(2) });
            assert!(!history.can_redo());
            assert_eq!(history.take(Direction::Undo).map(|a| a.id()), Some(BlockId(2)));
            assert!(!history.can_undo());
        }

        #[test]
        fn resizes_of_same_block_coalesce() {
            let mut history = History::new();
            let first = block(1, 6);
            let mut later = first.clone();
            later.set_duration(3660);

            history.record_resize(first.clone());
            history.record_resize(later);
            assert_eq!(
                history.take(Direction::Undo),
                Some(Action::Modify {
                    before: first,
                    resize: true
                })
            );
            assert!(!history.can_undo());
        }

        #[test]
        fn resize_does_not_fold_into_other_entries() {
            let mut history = History::new();
            let a = block(1, 6);
            history.record(Action::Modify {
                before: a.clone(),
                resize: false,
            });
            history.record_resize(a.clone());

            let mut recoloured = a.clone();
            recoloured.set_color(Color::Red);
            history.record_resize(recoloured);
            history.record_resize(block(2, 8));

            let mut count = 0;
            while history.take(Direction::Undo).is_some() {
                count += 1;
            }
            assert_eq!(count, 4);
        }
    }
}

pub mod store {
    //! Sorted, file-backed block collection.
    //!
    //! Blocks are kept strictly ordered by start. Placement and resize check the
    //! neighbours in that order plus the day window. A rejected operation returns
    //! `Ok(false)` and leaves memory and disk untouched; errors are kept for I/O
    //! failures and broken invariants.

    use crate::config::{Config, ConfigError, DEFAULT_EXTENSION, DayWindow, TimeFormats};
    use crate::core::*;
    use crate::history::{Action, Direction, History};
    use crate::parser::{BlockCodec, CodecError};
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
    use log::{debug, info, warn};
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use serde::Serialize;
    use std::{
        collections::HashSet,
        fs,
        path::{Path, PathBuf},
    };

    const RANDOM_ID_DRAWS: u32 = 64;

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("{} is not a directory", .0.display())]
        NotADirectory(PathBuf),
        #[error(transparent)]
        Codec(#[from] CodecError),
        #[error(transparent)]
        Config(#[from] ConfigError),
        #[error("block id {id} is used by both {first} and {second}")]
        DuplicateId {
            id: BlockId,
            first: String,
            second: String,
        },
        #[error("{first} and {second} both start at {start}")]
        DuplicateStart {
            start: NaiveDateTime,
            first: String,
            second: String,
        },
        #[error("block {id} is invalid: {source}")]
        Invariant {
            id: BlockId,
            #[source]
            source: DomainError,
        },
        #[error("no block with id {0}")]
        NoBlockWithId(BlockId),
        #[error("no free block id left after {attempts} attempts")]
        IdSpaceExhausted { attempts: u32 },
        #[error("unable to read folder {}: {source}", path.display())]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
    }

    pub type StoreResult<T> = Result<T, StoreError>;

    fn folder_io(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn describe(block: &Block) -> String {
        match block.source() {
            Some(path) => path.display().to_string(),
            None => format!("unsaved block {}", block.id()),
        }
    }

    /// Where the caller should look after an undo or redo.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct Focus {
        pub start: NaiveDateTime,
        pub id: BlockId,
    }

    impl Focus {
        fn of(block: &Block) -> Self {
            Self {
                start: block.start(),
                id: block.id(),
            }
        }
    }

    #[derive(Debug, Clone)]
    pub struct StoreOptions {
        pub codec: BlockCodec,
        pub window: DayWindow,
        /// Seconds.
        pub default_duration: i64,
        pub default_title: String,
    }

    impl StoreOptions {
        pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
            Ok(Self {
                codec: BlockCodec::new(config.time_formats()?, config.extension.clone()),
                window: config.day_window()?,
                default_duration: config.default_duration(),
                default_title: config.default_title.clone(),
            })
        }
    }

    impl Default for StoreOptions {
        fn default() -> Self {
            Self {
                codec: BlockCodec::new(TimeFormats::default(), DEFAULT_EXTENSION),
                window: DayWindow::default(),
                default_duration: 3600,
                default_title: "new block".to_string(),
            }
        }
    }

    #[derive(Debug)]
    pub struct BlockStore {
        folder: PathBuf,
        blocks: Vec<Block>,
        codec: BlockCodec,
        window: DayWindow,
        default_duration: i64,
        default_title: String,
        history: History,
        rng: StdRng,
    }

    impl BlockStore {
        /* ------------------------------ Loading ------------------------------ */

        /// Decode every regular file in `folder`. Any malformed file or
        /// duplicate id/start fails the whole load.
        pub fn open(folder: impl Into<PathBuf>, options: StoreOptions) -> StoreResult<Self> {
            let folder = folder.into();
            if !folder.is_dir() {
                return Err(StoreError::NotADirectory(folder));
            }

            let mut paths = Vec::new();
            for entry in fs::read_dir(&folder).map_err(folder_io(&folder))? {
                let entry = entry.map_err(folder_io(&folder))?;
                if entry.file_type().map_err(folder_io(&folder))?.is_file() {
                    paths.push(entry.path());
                }
            }
            paths.sort();

            let mut store = Self {
                folder,
                blocks: Vec::with_capacity(paths.len()),
                codec: options.codec,
                window: options.window,
                default_duration: options.default_duration,
                default_title: options.default_title,
                history: History::new(),
                rng: StdRng::from_entropy(),
            };
            for path in &paths {
                let block = store.codec.decode_file(path)?;
                store.insert(block)?;
            }
            info!(
                "loaded {} block(s) from {}",
                store.blocks.len(),
                store.folder.display()
            );
            Ok(store)
        }

        pub fn from_config(config: &Config) -> StoreResult<Self> {
            Self::open(config.folder(), StoreOptions::from_config(config)?)
        }

        /* ------------------------------ Queries ------------------------------ */

        pub fn folder(&self) -> &Path {
            &self.folder
        }

        pub fn codec(&self) -> &BlockCodec {
            &self.codec
        }

        pub fn window(&self) -> DayWindow {
            self.window
        }

        pub fn len(&self) -> usize {
            self.blocks.len()
        }

        pub fn is_empty(&self) -> bool {
            self.blocks.is_empty()
        }

        pub fn blocks(&self) -> Vec<Block> {
            self.blocks.clone()
        }

        pub fn can_undo(&self) -> bool {
            self.history.can_undo()
        }

        pub fn can_redo(&self) -> bool {
            self.history.can_redo()
        }

        /// Blocks starting within the calendar day, in start order.
        pub fn blocks_on_day(&self, date: NaiveDate) -> Vec<Block> {
            let from = date.and_time(NaiveTime::MIN);
            let until = from + Duration::days(1);
            let first = self.blocks.partition_point(|b| b.start() < from);
            self.blocks[first..]
                .iter()
                .take_while(|b| b.start() < until)
                .cloned()
                .collect()
        }

        pub fn index_at_exact_start(&self, start: NaiveDateTime) -> Option<usize> {
            self.blocks
                .binary_search_by_key(&start, |b| b.start())
                .ok()
        }

        pub fn block_at(&self, start: NaiveDateTime) -> Option<Block> {
            self.index_at_exact_start(start)
                .map(|i| self.blocks[i].clone())
        }

        pub fn find_by_id(&self, id: BlockId) -> Option<Block> {
            self.blocks.iter().find(|b| b.id() == id).cloned()
        }

        /// Re-check every store-wide invariant.
        pub fn verify(&self) -> StoreResult<()> {
            let mut ids = HashSet::new();
            for block in &self.blocks {
                block.validate().map_err(|source| StoreError::Invariant {
                    id: block.id(),
                    source,
                })?;
                if !ids.insert(block.id()) {
                    self.check_unique(block, None)?;
                }
            }
            for pair in self.blocks.windows(2) {
                if pair[0].start() >= pair[1].start() {
                    return Err(StoreError::DuplicateStart {
                        start: pair[1].start(),
                        first: describe(&pair[0]),
                        second: describe(&pair[1]),
                    });
                }
            }
            Ok(())
        }

        /// Unused id in `1..=MAX_ID`. Tries a bounded number of random draws,
        /// then sweeps the whole range once, so a full id space fails instead
        /// of looping.
        pub fn fresh_id(&mut self) -> StoreResult<BlockId> {
            self.fresh_id_within(MAX_ID)
        }

        fn fresh_id_within(&mut self, max: u32) -> StoreResult<BlockId> {
            let taken: HashSet<u32> = self.blocks.iter().map(|b| b.id().0).collect();
            for _ in 0..RANDOM_ID_DRAWS {
                let candidate = self.rng.gen_range(1..=max);
                if !taken.contains(&candidate) {
                    return Ok(BlockId(candidate));
                }
            }
            let offset = self.rng.gen_range(0..max);
            (0..max)
                .map(|k| (offset + k) % max + 1)
                .find(|candidate| !taken.contains(candidate))
                .map(BlockId)
                .ok_or(StoreError::IdSpaceExhausted {
                    attempts: RANDOM_ID_DRAWS + max,
                })
        }

        /// Add a decoded block in start order. Rejects duplicate ids and starts.
        pub fn insert(&mut self, block: Block) -> StoreResult<usize> {
            let id = block.id();
            block
                .validate()
                .map_err(|source| StoreError::Invariant { id, source })?;
            self.check_unique(&block, None)?;
            Ok(self.insert_sorted(block))
        }

        /* ------------------------ Placement and resize ------------------------ */

        /// New block of the default length starting at `start`, cut short by the
        /// next block or the end of the day window.
        pub fn place_below(&mut self, start: NaiveDateTime) -> StoreResult<bool> {
            let (day_start, day_end) = self.window.bounds(start.date());
            if start < day_start || start >= day_end {
                return Ok(false);
            }

            let next = self.blocks.partition_point(|b| b.start() < start);
            if next > 0 && self.blocks[next - 1].end() > start {
                return Ok(false);
            }
            let mut end = (start + Duration::seconds(self.default_duration)).min(day_end);
            if let Some(neighbour) = self.blocks.get(next) {
                if neighbour.start() <= start {
                    return Ok(false);
                }
                end = end.min(neighbour.start());
            }
            self.create((start, end))
        }

        /// New block of the default length ending at `end`, cut short by the
        /// previous block or the start of the day window.
        pub fn place_above(&mut self, end: NaiveDateTime) -> StoreResult<bool> {
            let (day_start, day_end) = self.window.bounds((end - Duration::minutes(1)).date());
            if end <= day_start || end > day_end {
                return Ok(false);
            }

            let next = self.blocks.partition_point(|b| b.start() < end);
            let mut start = (end - Duration::seconds(self.default_duration)).max(day_start);
            if next > 0 {
                let previous = &self.blocks[next - 1];
                if previous.end() >= end {
                    return Ok(false);
                }
                start = start.max(previous.end());
            }
            self.create((start, end))
        }

        pub fn extend_top_up(&mut self, start: NaiveDateTime) -> StoreResult<bool> {
            let Some(index) = self.locate(start) else {
                return Ok(false);
            };
            let (start, end) = self.blocks[index].interval();
            let new_start = start - Duration::minutes(1);
            if new_start < self.lower_bound(index) {
                return Ok(false);
            }
            self.retime(index, (new_start, end), true)
        }

        pub fn extend_top_down(&mut self, start: NaiveDateTime) -> StoreResult<bool> {
            let Some(index) = self.locate(start) else {
                return Ok(false);
            };
            let (start, end) = self.blocks[index].interval();
            let new_start = start + Duration::minutes(1);
            if new_start >= end {
                return Ok(false);
            }
            self.retime(index, (new_start, end), true)
        }

        pub fn extend_bottom_up(&mut self, start: NaiveDateTime) -> StoreResult<bool> {
            let Some(index) = self.locate(start) else {
                return Ok(false);
            };
            let (start, end) = self.blocks[index].interval();
            let new_end = end - Duration::minutes(1);
            if new_end <= start {
                return Ok(false);
            }
            self.retime(index, (start, new_end), true)
        }

        pub fn extend_bottom_down(&mut self, start: NaiveDateTime) -> StoreResult<bool> {
            let Some(index) = self.locate(start) else {
                return Ok(false);
            };
            let (start, end) = self.blocks[index].interval();
            let new_end = end + Duration::minutes(1);
            if new_end > self.upper_bound(index) {
                return Ok(false);
            }
            self.retime(index, (start, new_end), true)
        }

        /// Shift one minute earlier: grow the top edge, shrink the bottom.
        /// Like the edge edits, a run of moves is undone in one step.
        pub fn move_up(&mut self, start: NaiveDateTime) -> StoreResult<bool> {
            let Some(index) = self.locate(start) else {
                return Ok(false);
            };
            let (start, end) = self.blocks[index].interval();
            let step = Duration::minutes(1);
            if start - step < self.lower_bound(index) {
                return Ok(false);
            }
            self.retime(index, (start - step, end - step), true)
        }

        /// Shift one minute later: grow the bottom edge, shrink the top.
        pub fn move_down(&mut self, start: NaiveDateTime) -> StoreResult<bool> {
            let Some(index) = self.locate(start) else {
                return Ok(false);
            };
            let (start, end) = self.blocks[index].interval();
            let step = Duration::minutes(1);
            if end + step > self.upper_bound(index) {
                return Ok(false);
            }
            self.retime(index, (start + step, end + step), true)
        }

        /// Move to the same time `days` away, if that slot is free.
        pub fn move_lateral(&mut self, start: NaiveDateTime, days: i64) -> StoreResult<bool> {
            let Some(index) = self.locate(start) else {
                return Ok(false);
            };
            let Some(interval) = shift_days(self.blocks[index].interval(), days) else {
                return Ok(false);
            };
            if days == 0 || !self.is_free(interval, Some(index)) {
                return Ok(false);
            }
            self.retime(index, interval, false)
        }

        /// Duplicate the block at `start` under a fresh id so it begins at
        /// `new_start`. Only accepted when the full length fits.
        pub fn copy_block(
            &mut self,
            start: NaiveDateTime,
            new_start: NaiveDateTime,
        ) -> StoreResult<bool> {
            let Some(index) = self.locate(start) else {
                return Ok(false);
            };
            let mut copy = self.blocks[index].clone();
            let Some(end) = new_start.checked_add_signed(Duration::seconds(copy.duration())) else {
                return Ok(false);
            };
            let (day_start, day_end) = self.window.bounds(new_start.date());
            if new_start < day_start || end > day_end || !self.is_free((new_start, end), None) {
                return Ok(false);
            }

            let id = self.fresh_id()?;
            copy.set_id(id);
            copy.set_start(new_start);
            self.add(copy)?;
            self.history.record(Action::Create { id });
            debug!("copied block at {start} to {new_start} as {id}");
            Ok(true)
        }

        pub fn copy_lateral(&mut self, start: NaiveDateTime, days: i64) -> StoreResult<bool> {
            let target = Duration::try_days(days).and_then(|d| start.checked_add_signed(d));
            match target {
                Some(target) if days != 0 => self.copy_block(start, target),
                _ => Ok(false),
            }
        }

        /// Copy directly after the block (`below`) or directly before it.
        pub fn copy_vertical(&mut self, start: NaiveDateTime, below: bool) -> StoreResult<bool> {
            let Some(index) = self.locate(start) else {
                return Ok(false);
            };
            let block = &self.blocks[index];
            let target = if below {
                block.end()
            } else {
                block.start() - Duration::seconds(block.duration())
            };
            self.copy_block(start, target)
        }

        /* ----------------------------- Attributes ----------------------------- */

        pub fn rename(&mut self, start: NaiveDateTime, title: &str) -> StoreResult<bool> {
            self.edit(start, |b| b.set_title(title))
        }

        pub fn set_color(&mut self, start: NaiveDateTime, color: Color) -> StoreResult<bool> {
            self.edit(start, |b| b.set_color(color))
        }

        pub fn toggle_important(&mut self, start: NaiveDateTime) -> StoreResult<bool> {
            self.edit(start, Block::toggle_important)
        }

        pub fn toggle_collapsible(&mut self, start: NaiveDateTime) -> StoreResult<bool> {
            self.edit(start, Block::toggle_collapsible)
        }

        pub fn remove_block(&mut self, start: NaiveDateTime) -> StoreResult<bool> {
            let Some(index) = self.locate(start) else {
                return Ok(false);
            };
            let contents = self.codec.delete(&self.blocks[index])?;
            let before = self.blocks.remove(index);
            debug!("removed block {} at {start}", before.id());
            self.history.record(Action::Delete { before, contents });
            Ok(true)
        }

        /// Re-read the block's file after it was edited outside the store.
        /// Returns the block's start as read back, or `None` if the edited block
        /// would collide with another one.
        pub fn reload_block(&mut self, start: NaiveDateTime) -> StoreResult<Option<NaiveDateTime>> {
            let Some(index) = self.locate(start) else {
                return Ok(None);
            };
            let before = self.blocks[index].clone();
            let Some(path) = before.source() else {
                return Ok(None);
            };
            let reloaded = self.codec.decode_file(path)?;
            if self.check_unique(&reloaded, Some(index)).is_err()
                || !self.is_free(reloaded.interval(), Some(index))
            {
                warn!(
                    "edited block {} at {} collides with another block",
                    reloaded.id(),
                    reloaded.start()
                );
                return Ok(None);
            }

            let new_start = reloaded.start();
            self.blocks.remove(index);
            self.insert_sorted(reloaded);
            self.history.record(Action::Modify {
                before,
                resize: false,
            });
            Ok(Some(new_start))
        }

        /* ---------------------------- Undo / redo ---------------------------- */

        pub fn undo(&mut self) -> StoreResult<Option<Focus>> {
            self.step(Direction::Undo)
        }

        pub fn redo(&mut self) -> StoreResult<Option<Focus>> {
            self.step(Direction::Redo)
        }

        fn step(&mut self, direction: Direction) -> StoreResult<Option<Focus>> {
            let Some(action) = self.history.take(direction) else {
                return Ok(None);
            };
            match self.revert(&action) {
                Ok((inverse, focus)) => {
                    debug!("{direction:?} on block {} at {}", focus.id, focus.start);
                    self.history.give(direction.opposite(), inverse);
                    Ok(Some(focus))
                }
                Err(err) => {
                    self.history.give(direction, action);
                    Err(err)
                }
            }
        }

        /// Apply the inverse of `action`, returning the action that undoes that.
        fn revert(&mut self, action: &Action) -> StoreResult<(Action, Focus)> {
            match action {
                Action::Create { id } => {
                    let index = self.position_of(*id)?;
                    let contents = self.codec.delete(&self.blocks[index])?;
                    let before = self.blocks.remove(index);
                    let focus = Focus::of(&before);
                    Ok((Action::Delete { before, contents }, focus))
                }
                Action::Delete { before, contents } => {
                    let mut block = before.clone();
                    self.check_unique(&block, None)?;
                    match contents {
                        Some(text) => self.codec.restore(&block, text)?,
                        None => {
                            block.set_source(None);
                            block.mark_all_dirty();
                            self.codec.save(&mut block, &self.folder)?;
                        }
                    }
                    let focus = Focus::of(&block);
                    self.insert_sorted(block);
                    Ok((Action::Create { id: focus.id }, focus))
                }
                Action::Modify { before, .. } => {
                    let index = self.position_of(before.id())?;
                    let current = self.blocks[index].clone();
                    let mut restored = current.clone();
                    restored.restore_from(before);
                    self.check_unique(&restored, Some(index))?;
                    let focus = Focus::of(&restored);
                    self.commit(index, restored)?;
                    Ok((
                        Action::Modify {
                            before: current,
                            resize: false,
                        },
                        focus,
                    ))
                }
            }
        }

        /* ------------------------------ Internals ------------------------------ */

        fn locate(&self, start: NaiveDateTime) -> Option<usize> {
            let found = self.index_at_exact_start(start);
            if found.is_none() {
                warn!("no block starts at {start}");
            }
            found
        }

        fn position_of(&self, id: BlockId) -> StoreResult<usize> {
            self.blocks
                .iter()
                .position(|b| b.id() == id)
                .ok_or(StoreError::NoBlockWithId(id))
        }

        /// Earliest start the block at `index` may grow to.
        fn lower_bound(&self, index: usize) -> NaiveDateTime {
            let (day_start, _) = self.window.bounds(self.blocks[index].start().date());
            match index.checked_sub(1) {
                Some(previous) => self.blocks[previous].end().max(day_start),
                None => day_start,
            }
        }

        /// Latest end the block at `index` may grow to.
        fn upper_bound(&self, index: usize) -> NaiveDateTime {
            let (_, day_end) = self.window.bounds(self.blocks[index].start().date());
            match self.blocks.get(index + 1) {
                Some(next) => next.start().min(day_end),
                None => day_end,
            }
        }

        /// True if `[start, end)` overlaps no block other than the one at `skip`.
        fn is_free(&self, (start, end): Interval, skip: Option<usize>) -> bool {
            let at = self.blocks.partition_point(|b| b.start() < start);
            let previous = (0..at).rev().find(|&i| Some(i) != skip);
            let next = (at..self.blocks.len()).find(|&i| Some(i) != skip);
            previous.is_none_or(|i| self.blocks[i].end() <= start)
                && next.is_none_or(|i| self.blocks[i].start() >= end)
        }

        fn check_unique(&self, block: &Block, skip: Option<usize>) -> StoreResult<()> {
            let others = || {
                self.blocks
                    .iter()
                    .enumerate()
                    .filter(move |(i, _)| Some(*i) != skip)
                    .map(|(_, b)| b)
            };
            if let Some(other) = others().find(|b| b.id() == block.id()) {
                return Err(StoreError::DuplicateId {
                    id: block.id(),
                    first: describe(other),
                    second: describe(block),
                });
            }
            if let Some(other) = others().find(|b| b.start() == block.start()) {
                return Err(StoreError::DuplicateStart {
                    start: block.start(),
                    first: describe(other),
                    second: describe(block),
                });
            }
            Ok(())
        }

        fn insert_sorted(&mut self, block: Block) -> usize {
            let index = self.blocks.partition_point(|b| b.start() < block.start());
            self.blocks.insert(index, block);
            index
        }

        /// Persist a brand-new block and add it to the sequence.
        fn add(&mut self, mut block: Block) -> StoreResult<()> {
            let id = block.id();
            block
                .validate()
                .map_err(|source| StoreError::Invariant { id, source })?;
            self.check_unique(&block, None)?;
            self.codec.save(&mut block, &self.folder)?;
            self.insert_sorted(block);
            Ok(())
        }

        /// Persist `updated` in place of the block at `index`, keeping the order.
        fn commit(&mut self, index: usize, mut updated: Block) -> StoreResult<()> {
            let id = updated.id();
            updated
                .validate()
                .map_err(|source| StoreError::Invariant { id, source })?;
            self.codec.save(&mut updated, &self.folder)?;
            self.blocks.remove(index);
            self.insert_sorted(updated);
            Ok(())
        }

        fn create(&mut self, (start, end): Interval) -> StoreResult<bool> {
            let id = self.fresh_id()?;
            let block = Block::new(
                id,
                self.default_title.clone(),
                start,
                (end - start).num_seconds(),
            );
            self.add(block)?;
            self.history.record(Action::Create { id });
            debug!("placed block {id} at {start}..{end}");
            Ok(true)
        }

        fn retime(&mut self, index: usize, interval: Interval, resize: bool) -> StoreResult<bool> {
            let before = self.blocks[index].clone();
            let mut updated = before.clone();
            updated.set_interval(interval);
            self.commit(index, updated)?;
            debug!(
                "block {} now spans {}..{}",
                before.id(),
                interval.0,
                interval.1
            );
            if resize {
                self.history.record_resize(before);
            } else {
                self.history.record(Action::Modify {
                    before,
                    resize: false,
                });
            }
            Ok(true)
        }

        fn edit(&mut self, start: NaiveDateTime, apply: impl FnOnce(&mut Block)) -> StoreResult<bool> {
            let Some(index) = self.locate(start) else {
                return Ok(false);
            };
            let before = self.blocks[index].clone();
            let mut updated = before.clone();
            apply(&mut updated);
            if updated.dirty().is_empty() {
                return Ok(false);
            }
            self.commit(index, updated)?;
            debug!("updated block {} at {start}", before.id());
            self.history.record(Action::Modify {
                before,
                resize: false,
            });
            Ok(true)
        }
    }

    fn shift_days((start, end): Interval, days: i64) -> Option<Interval> {
        let shift = Duration::try_days(days)?;
        Some((
            start.checked_add_signed(shift)?,
            end.checked_add_signed(shift)?,
        ))
    }

}
