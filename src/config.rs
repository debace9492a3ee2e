// Config file model.
//
// The file is free-format and line oriented: a line starting with a keyword
// opens a logical line, indented lines continue it, `#` starts a comment and
// quoting protects spaces. Two keywords exist. DEVICE lines contribute glob
// patterns to the candidate-device set; ARRAY lines bind one md device to the
// identity that recognises its members.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::devices;
use crate::{MdError, MdResult};

/// Config file consulted when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/mdctl.conf";

/// Name-to-number mapping for raid levels (`pers` table).
const LEVELS: &[(&str, i32)] = &[
    ("linear", -1),
    ("raid0", 0),
    ("0", 0),
    ("stripe", 0),
    ("raid1", 1),
    ("1", 1),
    ("mirror", 1),
    ("raid4", 4),
    ("4", 4),
    ("raid5", 5),
    ("5", 5),
];

/// Name-to-number mapping for raid5 layouts.
const R5_LAYOUTS: &[(&str, i32)] = &[
    ("left_asymmetric", 0),
    ("right_asymmetric", 1),
    ("left_symmetric", 2),
    ("right_symmetric", 3),
    ("default", 2),
    ("la", 0),
    ("ra", 1),
    ("ls", 2),
    ("rs", 3),
];

pub fn level_from_name(name: &str) -> Option<i32> {
    let lower = name.to_ascii_lowercase();
    LEVELS.iter().find(|(n, _)| *n == lower).map(|(_, v)| *v)
}

pub fn level_name(level: i32) -> Option<&'static str> {
    LEVELS.iter().find(|(_, v)| *v == level).map(|(n, _)| *n)
}

pub fn r5_layout_from_name(name: &str) -> Option<i32> {
    let lower = name.to_ascii_lowercase();
    R5_LAYOUTS.iter().find(|(n, _)| *n == lower).map(|(_, v)| *v)
}

pub fn r5_layout_name(layout: i32) -> Option<&'static str> {
    R5_LAYOUTS.iter().find(|(_, v)| *v == layout).map(|(n, _)| *n)
}

/// Layout code applied when a raid5 array is created without one.
pub const DEFAULT_R5_LAYOUT: i32 = 2;

/// The discriminators that tell an assembly which disks belong together.
///
/// Every field is optional, but assembly refuses an identity with no
/// discriminator at all.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArrayIdentity {
    /// The md array device this identity describes, when known.
    pub device: Option<String>,
    pub uuid: Option<[u32; 4]>,
    pub super_minor: Option<u32>,
    pub level: Option<i32>,
    pub raid_disks: Option<u32>,
    /// Exact names or shell globs constraining member device names.
    pub device_globs: Option<Vec<String>>,
    /// Monitor-only tag grouping arrays that may exchange spares.
    pub spare_group: Option<String>,
}

impl ArrayIdentity {
    /// Whether assembly has anything at all to recognise members by.
    pub fn has_discriminator(&self) -> bool {
        self.uuid.is_some() || self.super_minor.is_some() || self.device_globs.is_some()
    }

    /// Apply the device-name predicate, if one is set.
    pub fn matches_name(&self, name: &str) -> bool {
        match &self.device_globs {
            None => true,
            Some(patterns) => patterns.iter().any(|p| {
                p == name
                    || glob::Pattern::new(p)
                        .map(|pat| pat.matches(name))
                        .unwrap_or(false)
            }),
        }
    }
}

/// Parse a 128-bit uuid given as 32 hex digits, with `:`, `.`, `-` and
/// space separators freely ignored. Anything else, or a digit count other
/// than 32, is rejected.
pub fn parse_uuid(s: &str) -> Option<[u32; 4]> {
    let mut uuid = [0u32; 4];
    let mut hit = 0usize;
    for c in s.chars() {
        let n = match c {
            '0'..='9' => c as u32 - '0' as u32,
            'a'..='f' => 10 + c as u32 - 'a' as u32,
            'A'..='F' => 10 + c as u32 - 'A' as u32,
            ':' | '.' | '-' | ' ' => continue,
            _ => return None,
        };
        if hit >= 32 {
            return None;
        }
        uuid[hit / 8] = (uuid[hit / 8] << 4) + n;
        hit += 1;
    }
    if hit == 32 {
        Some(uuid)
    } else {
        None
    }
}

/// The parsed config: device globs plus array identities. Built once and
/// passed to whoever needs it.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    device_patterns: Vec<String>,
    arrays: Vec<ArrayIdentity>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Keyword {
    Device,
    Array,
}

/// Keywords are case-insensitive and recognised from their first three or
/// more characters.
fn match_keyword(word: &str) -> Option<Keyword> {
    if word.len() < 3 {
        return None;
    }
    let lower = word.to_ascii_lowercase();
    if "device".starts_with(&lower) {
        Some(Keyword::Device)
    } else if "array".starts_with(&lower) {
        Some(Keyword::Array)
    } else {
        None
    }
}

/// Split one physical line into words, honouring quotes and `#` comments.
fn line_words(line: &str, out: &mut Vec<String>) {
    let mut chars = line.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(' ') | Some('\t')) {
            chars.next();
        }
        match chars.peek() {
            None | Some('#') => return,
            _ => {}
        }
        let mut word = String::new();
        let mut quote: Option<char> = None;
        while let Some(&c) = chars.peek() {
            match quote {
                Some(q) if c == q => {
                    quote = None;
                    chars.next();
                }
                Some(_) => {
                    word.push(c);
                    chars.next();
                }
                None if c == '\'' || c == '"' => {
                    quote = Some(c);
                    chars.next();
                }
                None if c == ' ' || c == '\t' => break,
                None => {
                    word.push(c);
                    chars.next();
                }
            }
        }
        out.push(word);
    }
}

/// Collapse the file into logical lines: an unindented line opens one,
/// indented lines continue it. Returns each logical line's words with the
/// physical line number it started on.
fn logical_lines(text: &str) -> Vec<(usize, Vec<String>)> {
    let mut lines: Vec<(usize, Vec<String>)> = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let trimmed = raw.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indented = raw.starts_with(' ') || raw.starts_with('\t');
        if indented {
            if let Some((_, words)) = lines.last_mut() {
                line_words(raw, words);
                continue;
            }
            // An indented line with nothing to continue is malformed; treat
            // it as its own line so its words are still diagnosed.
        }
        let mut words = Vec::new();
        line_words(raw, &mut words);
        if !words.is_empty() {
            lines.push((lineno + 1, words));
        }
    }
    lines
}

fn parse_device_line(words: &[String], patterns: &mut Vec<String>) {
    for w in words {
        if w.starts_with('/') {
            patterns.push(w.clone());
        } else {
            tracing::warn!("unrecognised word on DEVICE line: {}", w);
        }
    }
}

fn parse_array_line(lineno: usize, words: &[String]) -> Option<ArrayIdentity> {
    let mut ident = ArrayIdentity::default();
    for w in words {
        if w.starts_with('/') {
            if let Some(dev) = &ident.device {
                tracing::warn!(
                    "line {}: only give one device per ARRAY line: {} and {}",
                    lineno,
                    dev,
                    w
                );
            } else {
                ident.device = Some(w.clone());
            }
            continue;
        }
        let (key, value) = match w.split_once('=') {
            Some(kv) => kv,
            None => {
                tracing::warn!("line {}: unrecognised word on ARRAY line: {}", lineno, w);
                continue;
            }
        };
        match key.to_ascii_lowercase().as_str() {
            "uuid" => match parse_uuid(value) {
                Some(uuid) if ident.uuid.is_none() => ident.uuid = Some(uuid),
                Some(_) => tracing::warn!("line {}: only specify uuid once, {} ignored", lineno, w),
                None => tracing::warn!("line {}: bad uuid: {}", lineno, value),
            },
            "super-minor" => match value.parse::<u32>() {
                Ok(minor) => ident.super_minor = Some(minor),
                Err(_) => tracing::warn!("line {}: bad super-minor number: {}", lineno, value),
            },
            "devices" => {
                ident.device_globs =
                    Some(value.split(',').map(|s| s.trim().to_string()).collect());
            }
            "level" => match level_from_name(value) {
                Some(level) => ident.level = Some(level),
                None => tracing::warn!("line {}: unknown raid level: {}", lineno, value),
            },
            "num-devices" => match value.parse::<u32>() {
                Ok(n) => ident.raid_disks = Some(n),
                Err(_) => tracing::warn!("line {}: bad num-devices: {}", lineno, value),
            },
            "spare-group" => ident.spare_group = Some(value.to_string()),
            _ => tracing::warn!("line {}: unrecognised word on ARRAY line: {}", lineno, w),
        }
    }
    if ident.device.is_none() {
        tracing::warn!("line {}: ARRAY line without a device", lineno);
        return None;
    }
    if !ident.has_discriminator() {
        tracing::warn!(
            "line {}: ARRAY line {} has no identity information",
            lineno,
            ident.device.as_deref().unwrap_or("?")
        );
        return None;
    }
    Some(ident)
}

impl ConfigFile {
    /// Load the config, defaulting to /etc/mdctl.conf. A missing file is an
    /// empty config, not an error.
    pub fn load(path: Option<&Path>) -> MdResult<ConfigFile> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config file at {}", path.display());
                return Ok(ConfigFile::default());
            }
            Err(source) => {
                return Err(MdError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> ConfigFile {
        let mut config = ConfigFile::default();
        for (lineno, words) in logical_lines(text) {
            match match_keyword(&words[0]) {
                Some(Keyword::Device) => parse_device_line(&words[1..], &mut config.device_patterns),
                Some(Keyword::Array) => {
                    if let Some(ident) = parse_array_line(lineno, &words[1..]) {
                        config.arrays.push(ident);
                    }
                }
                None => tracing::warn!("line {}: unknown keyword {}", lineno, words[0]),
            }
        }
        config
    }

    /// Candidate device paths: every DEVICE glob expanded, deduplicated,
    /// in stable order.
    pub fn devices(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        devices::expand_globs(&self.device_patterns)
            .into_iter()
            .filter(|p| seen.insert(p.clone()))
            .collect()
    }

    pub fn identities(&self) -> &[ArrayIdentity] {
        &self.arrays
    }

    /// The identity bound to a given md array device, if the config names
    /// one.
    pub fn identity_for(&self, dev: &str) -> Option<&ArrayIdentity> {
        self.arrays.iter().find(|a| a.device.as_deref() == Some(dev))
    }
}
