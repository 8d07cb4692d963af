//! External encoder integration: codec profiles, capability detection
//! and metadata probing.
//!
//! The encoder is driven entirely through its command line and its
//! textual self-reports; nothing here links against it.

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::errors::{SyncError, SyncResult};

/// Fixed parameter set for one target video encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecProfile {
    pub name: &'static str,
    /// Build feature the encoder must report for this profile.
    pub feature: &'static str,
    pub args: &'static [&'static str],
    /// Replaces the input's extension on the output file.
    pub suffix: &'static str,
}

pub const CODEC_PROFILES: &[CodecProfile] = &[
    CodecProfile {
        name: "Video H264",
        feature: "--enable-libx264",
        args: &["-c:v", "libx264", "-acodec", "aac", "-strict", "-2"],
        suffix: "_H264.mp4",
    },
    CodecProfile {
        name: "Video H265",
        feature: "--enable-libx265",
        args: &["-c:v", "libx265", "-acodec", "aac", "-strict", "-2"],
        suffix: "_H265.mp4",
    },
    CodecProfile {
        name: "Video VP8",
        feature: "--enable-libvpx",
        args: &["-c:v", "libvpx", "-b:v", "1M", "-c:a", "libvorbis"],
        suffix: "_VP8.webm",
    },
    CodecProfile {
        name: "Video VP9",
        feature: "--enable-libvpx",
        args: &["-c:v", "libvpx-vp9", "-b:v", "2M", "-c:a", "libopus"],
        suffix: "_VP9.webm",
    },
];

/// Resolve the configured encoder executable: an existing path is taken
/// as-is, a bare name is searched on PATH.
pub fn locate(configured: &str) -> Option<PathBuf> {
    let candidate = Path::new(configured);
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }
    if candidate.components().count() > 1 {
        return None;
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(configured))
        .find(|full| full.is_file())
}

/// `--enable-<feature>` tokens from the encoder's no-argument
/// self-report.
pub fn extract_enable_tokens(output: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for line in output.lines() {
        if !line.contains("--") {
            continue;
        }
        for token in line.split_whitespace() {
            if token.starts_with("--enable-") && !tokens.iter().any(|t| t == token) {
                tokens.push(token.to_string());
            }
        }
    }
    tokens
}

/// One-time capability probe: run the encoder with no arguments and
/// collect its build features.
pub fn detect_features(exe: &Path) -> SyncResult<Vec<String>> {
    let output = Command::new(exe)
        .output()
        .map_err(|e| SyncError::EncoderNotFound(format!("{}: {}", exe.display(), e)))?;

    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    let features = extract_enable_tokens(&text);
    debug!("Encoder reports {} build features", features.len());
    Ok(features)
}

/// Profiles the detected encoder build can actually produce.
pub fn available_profiles(features: &[String]) -> Vec<&'static CodecProfile> {
    CODEC_PROFILES
        .iter()
        .filter(|profile| features.iter().any(|f| f == profile.feature))
        .collect()
}

/// Output file name for a transcode: the final extension is replaced by
/// the profile suffix.
pub fn output_name(file_name: &str, profile: &CodecProfile) -> String {
    match file_name.rfind('.') {
        Some(pos) => format!("{}{}", &file_name[..pos], profile.suffix),
        None => format!("{}{}", file_name, profile.suffix),
    }
}

/// Metadata probe invocation: `<exe> -hide_banner -i <input>`.
pub fn probe_command(exe: &Path, input: &Path) -> Command {
    let mut cmd = Command::new(exe);
    cmd.arg("-hide_banner").arg("-i").arg(input);
    cmd
}

/// Transcode invocation: `<exe> -hide_banner -i <input> <profile> <output>`.
pub fn transcode_command(
    exe: &Path,
    input: &Path,
    profile: &CodecProfile,
    output: &Path,
) -> Command {
    let mut cmd = Command::new(exe);
    cmd.arg("-hide_banner").arg("-i").arg(input);
    cmd.args(profile.args);
    cmd.arg(output);
    cmd
}

/// Condense the probe output into a short human-readable digest:
/// duration, codec names, resolution, frame rate and sample rate.
pub fn summarize_media_output(output: &str) -> String {
    let mut fragments: Vec<String> = Vec::new();

    for line in output.lines() {
        if !line.contains("Stream #0") && !line.contains("Duration:") {
            continue;
        }

        if let Some(pos) = line.find("Duration: ") {
            let stamp: String = line[pos + 10..].chars().take(8).collect();
            if stamp.len() == 8 && stamp != "00:00:00" {
                fragments.push(format!("Duration: {}", stamp));
            }
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        for (i, raw) in tokens.iter().enumerate() {
            let token = raw.trim_matches(',');
            match token {
                "Video:" | "Audio:" => {
                    if let Some(next) = tokens.get(i + 1) {
                        fragments.push(format!("{} {}", token, next.trim_matches(',')));
                    }
                }
                "fps" | "Hz" => {
                    if let Some(prev) = tokens.get(i.wrapping_sub(1)) {
                        if prev.chars().all(|c| c.is_ascii_digit() || c == '.') {
                            fragments.push(format!("{} {}", prev, token));
                        }
                    }
                }
                _ => {
                    if is_resolution(token) {
                        fragments.push(token.to_string());
                    }
                }
            }
        }
    }

    fragments.join(" ")
}

fn is_resolution(token: &str) -> bool {
    match token.split_once('x') {
        Some((w, h)) => {
            w.len() >= 2
                && h.len() >= 2
                && w.chars().all(|c| c.is_ascii_digit())
                && h.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Probe one media file and return the condensed details line, for the
/// show-resolution-info display.
pub fn media_details(exe: &Path, input: &Path) -> SyncResult<String> {
    let output = probe_command(exe, input)
        .output()
        .map_err(|e| SyncError::EncoderNotFound(format!("{}: {}", exe.display(), e)))?;

    // ffmpeg exits non-zero for a bare `-i` probe; its diagnostics are
    // still the payload here.
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(summarize_media_output(&text))
}
