//! Text parsing and controller upload of an ACF file (spec.md §4.2, parse
//! algorithm steps 1-5).

use md5::{Digest, Md5};

use crate::acf::{AcfDatabase, ConfigLine, ConfigMap, Geometry, ModeRecord, ParamLine, ParamMap};
use crate::camera_info::KeyKind;
use crate::error::{ArchonError, Result};
use crate::transport::Transport;

/// Result of a successful [`load_acf`]: the parsed database plus the
/// firmware filename and MD5 recorded for system FITS keys (spec.md §4.2
/// step 5).
pub struct AcfLoadResult {
    pub database: AcfDatabase,
    pub firmware_path: String,
    pub firmware_md5: String,
}

/// Normalizes one raw ACF line: strip quotes, tabs to spaces, backslash to
/// forward slash (spec.md §4.2 step 2).
fn normalize_line(line: &str) -> String {
    line.replace(['"', '\''], "")
        .replace('\t', " ")
        .replace('\\', "/")
        .trim()
        .to_string()
}

enum Section {
    BeforeConfig,
    Config,
    Mode(String),
}

/// Parses `text` and, if `write_to_archon`, uploads every configmap line to
/// the controller via `WCONFIG` (spec.md §4.2 steps 1-5). On any malformed
/// syntax or duplicate mode the load is aborted and an error returned —
/// callers are expected to leave `firmwareloaded=false` on failure.
pub async fn load_acf(
    transport: Option<&Transport>,
    firmware_path: &str,
    text: &str,
) -> Result<AcfLoadResult> {
    if let Some(t) = transport {
        t.command("POLLOFF").await?;
        t.command("CLEARCONFIG").await?;
    }

    let mut database = AcfDatabase::new();
    let mut section = Section::BeforeConfig;

    for (lineno, raw_line) in text.lines().enumerate() {
        let line_number = lineno + 1;
        let line = normalize_line(raw_line);
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if rest.eq_ignore_ascii_case("CONFIG") {
                section = Section::Config;
            } else if let Some(mode_name) = rest.strip_prefix("MODE_") {
                let mode_name = mode_name.to_ascii_uppercase();
                if database.modemap.contains_key(&mode_name) {
                    return Err(ArchonError::DuplicateMode(mode_name));
                }
                database.modemap.insert(mode_name.clone(), ModeRecord::default());
                section = Section::Mode(mode_name);
            } else {
                return Err(ArchonError::AcfParse {
                    line: line_number,
                    message: format!("unknown section `[{rest}]`"),
                });
            }
            continue;
        }

        match &section {
            Section::BeforeConfig => {}
            Section::Config => {
                parse_config_line(&mut database.configmap, &mut database.parammap, &line, line_number)?;
            }
            Section::Mode(mode_name) => {
                let mode = database
                    .modemap
                    .get_mut(mode_name)
                    .expect("section tracks an existing mode entry");
                parse_mode_line(mode, &line, line_number)?;
            }
        }
    }

    if let Some(t) = transport {
        for (key, entry) in &database.configmap {
            if entry.value.is_empty() {
                continue;
            }
            t.command(&format!(
                "WCONFIG{:04X}{key}={}",
                entry.line, entry.value
            ))
            .await?;
        }
        t.command("POLLON").await?;
    }

    for (mode_name, mode) in &database.modemap {
        if mode.rawenable.is_none() && mode_name != "RAW" {
            return Err(ArchonError::MissingRawEnable(mode_name.clone()));
        }
    }

    let md5 = compute_md5(text);

    Ok(AcfLoadResult {
        database: AcfDatabase {
            firmware_path: Some(firmware_path.to_string()),
            firmware_md5: Some(md5.clone()),
            ..database
        },
        firmware_path: firmware_path.to_string(),
        firmware_md5: md5,
    })
}

fn compute_md5(text: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parses one `[CONFIG]` body line: `PARAMETERn=Name=Value` populates both
/// maps with the same line number; everything else is a plain
/// configmap `KEY=VALUE` (spec.md §4.2 step 3).
fn parse_config_line(
    configmap: &mut ConfigMap,
    parammap: &mut ParamMap,
    line: &str,
    line_number: usize,
) -> Result<()> {
    let Some((key, value)) = line.split_once('=') else {
        return Err(ArchonError::AcfParse {
            line: line_number,
            message: format!("expected KEY=VALUE, got `{line}`"),
        });
    };
    if let Some((pn, name, val)) = split_parametern(key, value) {
        parammap.insert(
            name.to_string(),
            ParamLine {
                key: pn.to_string(),
                name: name.to_string(),
                value: val.to_string(),
                line: line_number as u16,
            },
        );
        configmap.insert(
            pn.to_string(),
            ConfigLine {
                line: line_number as u16,
                value: format!("{name}={val}"),
            },
        );
        return Ok(());
    }
    configmap.insert(
        key.to_string(),
        ConfigLine {
            line: line_number as u16,
            value: value.to_string(),
        },
    );
    Ok(())
}

/// Parses one `[MODE_xxxx]` line, dispatching on its `ACF:`/`ARCH:`/`FITS:`
/// tag prefix (spec.md §4.2).
fn parse_mode_line(mode: &mut ModeRecord, line: &str, line_number: usize) -> Result<()> {
    if let Some(rest) = line.strip_prefix("ACF:") {
        let (key, value) = split_kv(rest, line_number)?;
        if key.eq_ignore_ascii_case("RAWENABLE") {
            mode.rawenable = Some(value == "1" || value.eq_ignore_ascii_case("true"));
        }
        if let Some((pn, name, val)) = split_parametern(key, value) {
            mode.parammap.insert(
                name.to_string(),
                ParamLine {
                    key: pn.to_string(),
                    name: name.to_string(),
                    value: val.to_string(),
                    line: line_number as u16,
                },
            );
        } else {
            mode.configmap.insert(
                key.to_string(),
                ConfigLine {
                    line: line_number as u16,
                    value: value.to_string(),
                },
            );
        }
        Ok(())
    } else if let Some(rest) = line.strip_prefix("ARCH:") {
        let (key, value) = split_kv(rest, line_number)?;
        let num: u32 = value.parse().map_err(|_| ArchonError::AcfParse {
            line: line_number,
            message: format!("ARCH value `{value}` is not an integer"),
        })?;
        match key {
            "NUM_DETECT" => mode.geometry.num_detect = num,
            "HORI_AMPS" => mode.geometry.amps[0] = num,
            "VERT_AMPS" => mode.geometry.amps[1] = num,
            _ => {
                return Err(ArchonError::AcfParse {
                    line: line_number,
                    message: format!("unknown ARCH key `{key}`"),
                })
            }
        }
        Ok(())
    } else if let Some(rest) = line.strip_prefix("FITS:") {
        let (keyword, rhs) = split_kv(rest, line_number)?;
        let mut parts = rhs.splitn(2, '/');
        let value = parts.next().unwrap_or("").trim();
        let comment = parts.next().map(str::trim);
        if rhs.matches('/').count() > 1 {
            return Err(ArchonError::AcfParse {
                line: line_number,
                message: "FITS directive must have exactly one `/` separator".to_string(),
            });
        }
        mode.fits_keys.add_key(keyword, KeyKind::String, value, comment);
        Ok(())
    } else {
        Err(ArchonError::AcfParse {
            line: line_number,
            message: format!("unknown mode directive `{line}`"),
        })
    }
}

fn split_kv(s: &str, line_number: usize) -> Result<(&str, &str)> {
    s.split_once('=').ok_or_else(|| ArchonError::AcfParse {
        line: line_number,
        message: format!("expected KEY=VALUE, got `{s}`"),
    })
}

/// If `key` is `PARAMETERn` and `value` is `Name=Value`, splits into
/// `(key, name, value)`.
fn split_parametern<'a>(key: &'a str, value: &'a str) -> Option<(&'a str, &'a str, &'a str)> {
    if !key.starts_with("PARAMETER") || !key["PARAMETER".len()..].chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    let (name, val) = value.split_once('=')?;
    Some((key, name, val))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_ACF: &str = "\
[CONFIG]
PIXELCOUNT=1024
LINECOUNT=1024
PARAMETER0=ExposeParam=0

[MODE_DEFAULT]
ACF:RAWENABLE=0
ACF:PARAMETER1=SampMode=2
ARCH:NUM_DETECT=1
ARCH:HORI_AMPS=2
ARCH:VERT_AMPS=1
FITS:INSTRUME=archon/test instrument

[MODE_RAW]
ACF:RAWENABLE=1
";

    #[tokio::test]
    async fn parses_config_and_mode_sections() {
        let result = load_acf(None, "/tmp/test.acf", SAMPLE_ACF).await.unwrap();
        let db = result.database;
        assert_eq!(db.configmap["PIXELCOUNT"].value, "1024");
        assert_eq!(db.parammap["ExposeParam"].value, "0");

        let default_mode = db.mode("DEFAULT").unwrap();
        assert_eq!(default_mode.rawenable, Some(false));
        assert_eq!(default_mode.geometry.num_detect, 1);
        assert_eq!(default_mode.geometry.amps, [2, 1]);
        assert_eq!(default_mode.parammap["SampMode"].value, "2");

        let (kw, entry) = default_mode.fits_keys.iter().next().unwrap();
        assert_eq!(kw, "INSTRUME");
        assert_eq!(
            entry.comment.as_deref(),
            Some("test instrument")
        );
    }

    #[tokio::test]
    async fn duplicate_mode_section_is_fatal() {
        let text = "[MODE_DEFAULT]\nACF:RAWENABLE=1\n[MODE_DEFAULT]\nACF:RAWENABLE=1\n";
        let err = load_acf(None, "/tmp/d.acf", text).await.unwrap_err();
        assert!(matches!(err, ArchonError::DuplicateMode(_)));
    }

    #[tokio::test]
    async fn missing_rawenable_outside_raw_is_fatal() {
        let text = "[MODE_DEFAULT]\nARCH:NUM_DETECT=1\n";
        let err = load_acf(None, "/tmp/m.acf", text).await.unwrap_err();
        assert!(matches!(err, ArchonError::MissingRawEnable(_)));
    }

    #[tokio::test]
    async fn raw_mode_is_exempt_from_rawenable_requirement() {
        let text = "[MODE_RAW]\nARCH:NUM_DETECT=1\n";
        let result = load_acf(None, "/tmp/r.acf", text).await.unwrap();
        assert!(result.database.mode("RAW").is_some());
    }

    #[test]
    fn md5_is_stable_for_same_content() {
        assert_eq!(compute_md5("hello"), compute_md5("hello"));
        assert_ne!(compute_md5("hello"), compute_md5("world"));
    }
}
