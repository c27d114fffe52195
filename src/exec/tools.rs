// src/exec/tools.rs

//! The two production [`ExternalToolRunner`]s.
//!
//! Both render a configurable command template and spawn it as a
//! [`SpawnedProcess`]. They differ in which placeholders they fill and in how
//! they read the tool's output.

use std::sync::LazyLock;

use anyhow::{bail, Result};
use regex::Regex;

use crate::exec::process::SpawnedProcess;
use crate::exec::runner::{
    ExternalToolRunner, ProgressUpdate, TerminalCondition, ToolInvocation, ToolProcess, ToolSignal,
};

/// Program plus argument templates with `{placeholder}` substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Replace every `{name}` from `vars`. Unknown placeholders are an error.
    pub fn render(&self, vars: &[(&str, &str)]) -> Result<Vec<String>> {
        self.args.iter().map(|arg| render_one(arg, vars)).collect()
    }
}

fn render_one(template: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            bail!("unterminated placeholder in '{template}'");
        };
        let name = &after[..end];
        match vars.iter().find(|(k, _)| *k == name) {
            Some((_, value)) => out.push_str(value),
            None => bail!("unknown placeholder '{{{name}}}' in '{template}'"),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Names each template may use.
pub const CAPTURE_PLACEHOLDERS: &[&str] = &["source", "work_dir", "quality"];
pub const REMUX_PLACEHOLDERS: &[&str] = &["concat_list", "output", "work_dir"];

/// Check a template against the allowed placeholder names.
pub fn check_placeholders(template: &CommandTemplate, allowed: &[&str]) -> Result<()> {
    let vars: Vec<(&str, &str)> = allowed.iter().map(|name| (*name, "")).collect();
    template.render(&vars).map(|_| ())
}

pub fn default_capture_args() -> Vec<String> {
    [
        "--newline",
        "--no-part",
        "-N",
        "8",
        "-f",
        "{quality}",
        "--hls-use-mpegts",
        "-o",
        "{work_dir}/fragment-%(autonumber)05d.%(ext)s",
        "{source}",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

pub fn default_remux_args() -> Vec<String> {
    [
        "-hide_banner",
        "-nostdin",
        "-y",
        "-f",
        "concat",
        "-safe",
        "0",
        "-i",
        "{concat_list}",
        "-c",
        "copy",
        "-movflags",
        "+faststart",
        "{output}",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[download\]\s+(?P<pct>[0-9.]+)%(?:.*?of\s+~?\s*(?P<size>[0-9.]+)(?P<unit>[KMG]iB))?(?:.*?ETA\s+(?P<eta>[0-9:.]+))?",
    )
    .expect("valid progress regex")
});

/// Ordered: the first matching rule wins.
static CAPTURE_RULES: LazyLock<Vec<(Regex, TerminalCondition)>> = LazyLock::new(|| {
    let rule = |pattern: &str, condition| {
        (
            Regex::new(pattern).expect("valid classifier regex"),
            condition,
        )
    };
    vec![
        rule(r"(?i)no space left on device", TerminalCondition::DiskExhausted),
        rule(
            r"(?i)(is not currently live|will begin in|premieres in|is offline)",
            TerminalCondition::NotLive,
        ),
        rule(
            r"(?i)(HTTP Error 40[13]|sign in to confirm|members[- ]only|login required|private video)",
            TerminalCondition::AuthenticationFailed,
        ),
        rule(
            r"(?i)(HTTP Error 404|unsupported url|video unavailable|does not exist)",
            TerminalCondition::SourceNotFound,
        ),
        rule(r"(?i)(timed out|timeout)", TerminalCondition::NetworkTimeout),
        rule(r"(?i)HTTP Error 5\d\d", TerminalCondition::ServerError),
        rule(
            r"(?i)(connection reset|connection refused|name resolution|temporary failure in name|unable to download)",
            TerminalCondition::NetworkError,
        ),
        rule(
            r"(?i)(stream (has )?ended|\[download\]\s+100(\.0+)?%)",
            TerminalCondition::EndedNormally,
        ),
    ]
});

static REMUX_RULES: LazyLock<Vec<(Regex, TerminalCondition)>> = LazyLock::new(|| {
    vec![(
        Regex::new(r"(?i)no space left on device").expect("valid classifier regex"),
        TerminalCondition::DiskExhausted,
    )]
});

fn match_rules(rules: &[(Regex, TerminalCondition)], line: &str) -> Option<TerminalCondition> {
    rules
        .iter()
        .find(|(re, _)| re.is_match(line))
        .map(|(_, condition)| *condition)
}

/// Parse a `[download]  42.0% of ~1.50GiB at ... ETA 00:10` line.
pub fn parse_progress(line: &str) -> Option<ProgressUpdate> {
    let caps = PROGRESS_RE.captures(line)?;
    let percent: f64 = caps.name("pct")?.as_str().parse().ok()?;
    let total_mib = match (caps.name("size"), caps.name("unit")) {
        (Some(size), Some(unit)) => size.as_str().parse::<f64>().ok().map(|v| match unit.as_str() {
            "KiB" => v / 1024.0,
            "GiB" => v * 1024.0,
            _ => v,
        }),
        _ => None,
    };
    Some(ProgressUpdate {
        percent,
        total_mib,
        eta: caps.name("eta").map(|m| m.as_str().to_string()),
    })
}

/// Live-stream downloader.
#[derive(Debug, Clone)]
pub struct CaptureTool {
    template: CommandTemplate,
    quality: String,
}

impl CaptureTool {
    pub fn new(template: CommandTemplate, quality: impl Into<String>) -> Self {
        Self {
            template,
            quality: quality.into(),
        }
    }
}

impl ExternalToolRunner for CaptureTool {
    fn name(&self) -> &str {
        "capture"
    }

    fn start(&self, invocation: &ToolInvocation) -> Result<Box<dyn ToolProcess>> {
        let ToolInvocation::Capture {
            source, work_dir, ..
        } = invocation
        else {
            bail!("capture tool cannot run {invocation:?}");
        };
        let work_dir_str = work_dir.to_string_lossy();
        let args = self.template.render(&[
            ("source", source.as_str()),
            ("work_dir", &*work_dir_str),
            ("quality", self.quality.as_str()),
        ])?;
        let process = SpawnedProcess::spawn(self.name(), &self.template.program, &args, work_dir)?;
        Ok(Box::new(process))
    }

    fn classify(&self, line: &str) -> ToolSignal {
        // The final 100% line is both; the end-of-stream reading wins.
        if let Some(condition) = match_rules(&CAPTURE_RULES, line) {
            return ToolSignal::Terminal(condition);
        }
        match parse_progress(line) {
            Some(progress) => ToolSignal::Progress(progress),
            None => ToolSignal::Output,
        }
    }
}

/// Copy-mode remuxer.
#[derive(Debug, Clone)]
pub struct RemuxTool {
    template: CommandTemplate,
}

impl RemuxTool {
    pub fn new(template: CommandTemplate) -> Self {
        Self { template }
    }
}

impl ExternalToolRunner for RemuxTool {
    fn name(&self) -> &str {
        "remux"
    }

    fn start(&self, invocation: &ToolInvocation) -> Result<Box<dyn ToolProcess>> {
        let ToolInvocation::Remux {
            concat_list,
            output,
            work_dir,
            ..
        } = invocation
        else {
            bail!("remux tool cannot run {invocation:?}");
        };
        let concat_list = concat_list.to_string_lossy();
        let output = output.to_string_lossy();
        let work_dir_str = work_dir.to_string_lossy();
        let args = self.template.render(&[
            ("concat_list", &*concat_list),
            ("output", &*output),
            ("work_dir", &*work_dir_str),
        ])?;
        let process = SpawnedProcess::spawn(self.name(), &self.template.program, &args, work_dir)?;
        Ok(Box::new(process))
    }

    fn classify(&self, line: &str) -> ToolSignal {
        match match_rules(&REMUX_RULES, line) {
            Some(condition) => ToolSignal::Terminal(condition),
            None => ToolSignal::Output,
        }
    }
}
