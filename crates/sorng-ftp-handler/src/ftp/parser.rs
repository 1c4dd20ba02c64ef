//! Directory listing decoder.
//!
//! Servers answer `LIST` in whatever shape their platform prefers. Each line
//! is tried against three dialects in turn:
//!
//! - RFC 3659 fact lines, e.g. `type=dir;modify=20251103091500; backups`
//! - `ls -l` output, e.g. `drwxr-x---  3 ftp ftp 512 Nov  3 09:15 backups`
//! - DOS/IIS output, e.g. `11-03-25  09:15AM  <DIR>  backups`
//!
//! Anything else is skipped. So are the `.`/`..` self references and the
//! `total N` line that `ls` prints first.

use crate::ftp::types::{FtpFile, FtpFileKind};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref LS_LINE: Regex = Regex::new(concat!(
        r"^(?P<mode>[dlcbps-][rwxsStT-]{9})[+@.]?\s+",
        r"\d+\s+\S+\s+(?:\S+\s+)?",
        r"(?P<size>\d+)\s+",
        r"(?P<stamp>[A-Za-z]{3}\s+\d{1,2}\s+(?:\d{1,2}:\d{2}|\d{4}))\s+",
        r"(?P<name>.+)$",
    ))
    .expect("ls line pattern");
    static ref DOS_LINE: Regex = Regex::new(concat!(
        r"^(?P<date>\d{2}-\d{2}-\d{2,4})\s+",
        r"(?P<time>\d{1,2}:\d{2}(?:[AaPp][Mm])?)\s+",
        r"(?P<size><DIR>|\d+)\s+",
        r"(?P<name>.+)$",
    ))
    .expect("dos line pattern");
}

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Decode a whole listing reply into entries, in server order.
pub fn parse_listing(raw: &str) -> Vec<FtpFile> {
    raw.lines()
        .filter_map(parse_line)
        .filter(|entry| !matches!(entry.name.as_str(), "." | ".."))
        .collect()
}

/// Decode one listing line. `None` when no dialect recognises it.
pub fn parse_line(line: &str) -> Option<FtpFile> {
    let line = line.trim_end_matches(['\r', '\n']);
    let body = line.trim_start();
    if body.is_empty() || body.starts_with("total ") {
        return None;
    }
    facts_entry(line)
        .or_else(|| ls_entry(body))
        .or_else(|| dos_entry(body))
}

fn facts_entry(line: &str) -> Option<FtpFile> {
    let (facts, name) = line.split_once("; ")?;
    if name.is_empty() || !facts.contains('=') || facts.contains(char::is_whitespace) {
        return None;
    }

    let mut entry = FtpFile::new(name, FtpFileKind::Unknown, 0);
    for (key, value) in facts.split(';').filter_map(|fact| fact.split_once('=')) {
        let value = value.to_ascii_lowercase();
        match key.to_ascii_lowercase().as_str() {
            "type" => entry.kind = fact_kind(&value),
            "size" | "sizd" => entry.size = value.parse().unwrap_or(0),
            "modify" => entry.modified = fact_timestamp(&value),
            _ => {}
        }
    }
    Some(entry)
}

fn fact_kind(value: &str) -> FtpFileKind {
    match value {
        "file" => FtpFileKind::File,
        "dir" | "cdir" | "pdir" => FtpFileKind::Directory,
        "os.unix=symlink" | "os.unix=slink" => FtpFileKind::SymbolicLink,
        _ => FtpFileKind::Unknown,
    }
}

/// `YYYYMMDDHHMMSS`, optionally followed by a fraction that is ignored.
fn fact_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let whole_seconds = value.split('.').next()?;
    NaiveDateTime::parse_from_str(whole_seconds, "%Y%m%d%H%M%S")
        .ok()
        .map(|stamp| Utc.from_utc_datetime(&stamp))
}

fn ls_entry(line: &str) -> Option<FtpFile> {
    let caps = LS_LINE.captures(line)?;
    let kind = match caps["mode"].chars().next() {
        Some('-') => FtpFileKind::File,
        Some('d') => FtpFileKind::Directory,
        Some('l') => FtpFileKind::SymbolicLink,
        _ => FtpFileKind::Unknown,
    };

    let mut name = &caps["name"];
    if kind == FtpFileKind::SymbolicLink {
        if let Some((link, _target)) = name.split_once(" -> ") {
            name = link;
        }
    }

    let mut entry = FtpFile::new(name, kind, caps["size"].parse().unwrap_or(0));
    entry.modified = ls_timestamp(&caps["stamp"], Utc::now());
    Some(entry)
}

/// `ls` prints `Mon DD HH:MM` for recent files and `Mon DD YYYY` otherwise.
/// A recent stamp that would land in the future belongs to last year.
fn ls_timestamp(stamp: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut fields = stamp.split_whitespace();
    let month_name = fields.next()?.to_ascii_lowercase();
    let month = MONTHS.iter().position(|m| *m == month_name)? as u32 + 1;
    let day: u32 = fields.next()?.parse().ok()?;
    let last = fields.next()?;

    let at = |year: i32, time: NaiveTime| {
        NaiveDate::from_ymd_opt(year, month, day).map(|date| Utc.from_utc_datetime(&date.and_time(time)))
    };

    match last.split_once(':') {
        Some((hour, minute)) => {
            let time = NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)?;
            match at(now.year(), time) {
                Some(this_year) if this_year <= now + Duration::days(1) => Some(this_year),
                _ => at(now.year() - 1, time),
            }
        }
        None => at(last.parse().ok()?, NaiveTime::from_hms_opt(0, 0, 0)?),
    }
}

fn dos_entry(line: &str) -> Option<FtpFile> {
    let caps = DOS_LINE.captures(line)?;
    let mut entry = match &caps["size"] {
        "<DIR>" => FtpFile::new(&caps["name"], FtpFileKind::Directory, 0),
        bytes => FtpFile::new(&caps["name"], FtpFileKind::File, bytes.parse().unwrap_or(0)),
    };
    entry.modified = dos_timestamp(&caps["date"], &caps["time"]);
    Some(entry)
}

/// `MM-DD-YY` or `MM-DD-YYYY`, with a 12 or 24 hour clock.
fn dos_timestamp(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let mut parts = date.split('-');
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    let year_text = parts.next()?;
    let mut year: i32 = year_text.parse().ok()?;
    if year_text.len() == 2 {
        year += if year < 70 { 2000 } else { 1900 };
    }

    let upper = time.to_ascii_uppercase();
    let (clock, meridiem) = match upper.strip_suffix("AM") {
        Some(clock) => (clock, Some(false)),
        None => match upper.strip_suffix("PM") {
            Some(clock) => (clock, Some(true)),
            None => (upper.as_str(), None),
        },
    };
    let (hour, minute) = clock.split_once(':')?;
    let mut hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    match meridiem {
        Some(pm) if hour <= 12 => hour = hour % 12 + if pm { 12 } else { 0 },
        Some(_) => return None,
        None => {}
    }

    let stamp = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;
    Some(Utc.from_utc_datetime(&stamp))
}
