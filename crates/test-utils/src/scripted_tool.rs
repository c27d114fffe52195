use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use multirec::exec::runner::{ExternalToolRunner, ProcessEvent, ToolExit, ToolInvocation, ToolProcess, ToolSignal};
use multirec::exec::tools::{default_capture_args, default_remux_args};
use multirec::exec::{CaptureTool, CommandTemplate, RemuxTool};
use multirec::fs::FileSystem;
use tokio::time::Instant;

/// One thing a scripted tool does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Emit an output line.
    Line(String),
    /// Write `bytes` to `<work_dir>/<name>`.
    Fragment { name: String, bytes: Vec<u8> },
    /// Write `bytes` to the invocation's output path (remux only).
    Output(Vec<u8>),
    Sleep(Duration),
    Exit(i32),
    /// Produce nothing more until stopped or killed.
    Hang,
    /// Panic inside the worker that is reading this tool.
    Panic(&'static str),
}

#[derive(Debug, Default)]
pub struct ToolStats {
    starts: AtomicUsize,
    stop_requests: AtomicUsize,
    kills: AtomicUsize,
    invocations: Mutex<Vec<ToolInvocation>>,
}

/// An `ExternalToolRunner` that plays back scripts instead of running a
/// program. Output lines are classified by the real capture/remux rules.
#[derive(Debug, Clone)]
pub struct ScriptedTool {
    name: &'static str,
    fs: Arc<dyn FileSystem>,
    classifier: Arc<dyn ExternalToolRunner>,
    scripts: Arc<Mutex<VecDeque<Vec<Step>>>>,
    fallback: Arc<Mutex<Vec<Step>>>,
    ignore_stop: bool,
    stats: Arc<ToolStats>,
}

impl ScriptedTool {
    fn new(name: &'static str, fs: Arc<dyn FileSystem>, classifier: Arc<dyn ExternalToolRunner>) -> Self {
        Self {
            name,
            fs,
            classifier,
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(vec![Step::Exit(0)])),
            ignore_stop: false,
            stats: Arc::new(ToolStats::default()),
        }
    }

    pub fn capture(fs: Arc<dyn FileSystem>) -> Self {
        let classifier = CaptureTool::new(CommandTemplate::new("yt-dlp", default_capture_args()), "best");
        Self::new("scripted-capture", fs, Arc::new(classifier))
    }

    pub fn remux(fs: Arc<dyn FileSystem>) -> Self {
        let classifier = RemuxTool::new(CommandTemplate::new("ffmpeg", default_remux_args()));
        Self::new("scripted-remux", fs, Arc::new(classifier))
    }

    /// Script for the next start; scripts are used in order.
    pub fn push_script(&self, steps: Vec<Step>) -> &Self {
        self.scripts.lock().unwrap().push_back(steps);
        self
    }

    /// Script used once the queue is empty.
    pub fn set_fallback(&self, steps: Vec<Step>) -> &Self {
        *self.fallback.lock().unwrap() = steps;
        self
    }

    /// Model a tool that does not react to the graceful stop.
    pub fn ignoring_stop(mut self) -> Self {
        self.ignore_stop = true;
        self
    }

    pub fn starts(&self) -> usize {
        self.stats.starts.load(Ordering::SeqCst)
    }

    pub fn stop_requests(&self) -> usize {
        self.stats.stop_requests.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.stats.kills.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.stats.invocations.lock().unwrap().clone()
    }
}

impl ExternalToolRunner for ScriptedTool {
    fn name(&self) -> &str {
        self.name
    }

    fn start(&self, invocation: &ToolInvocation) -> anyhow::Result<Box<dyn ToolProcess>> {
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        self.stats.invocations.lock().unwrap().push(invocation.clone());

        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().unwrap().clone());
        let output = match invocation {
            ToolInvocation::Remux { output, .. } => Some(output.clone()),
            ToolInvocation::Capture { .. } => None,
        };

        Ok(Box::new(ScriptedProcess {
            steps: steps.into(),
            fs: Arc::clone(&self.fs),
            work_dir: invocation.work_dir().clone(),
            output,
            sleep_until: None,
            exit: None,
            exit_delivered: false,
            ignore_stop: self.ignore_stop,
            stats: Arc::clone(&self.stats),
        }))
    }

    fn classify(&self, line: &str) -> ToolSignal {
        self.classifier.classify(line)
    }
}

struct ScriptedProcess {
    steps: VecDeque<Step>,
    fs: Arc<dyn FileSystem>,
    work_dir: PathBuf,
    output: Option<PathBuf>,
    /// Kept across polls so a dropped `next_event` does not restart a sleep.
    sleep_until: Option<Instant>,
    exit: Option<ToolExit>,
    exit_delivered: bool,
    ignore_stop: bool,
    stats: Arc<ToolStats>,
}

impl ScriptedProcess {
    fn write(&mut self, path: PathBuf, bytes: &[u8]) {
        if self.fs.write(&path, bytes).is_err() {
            self.exit = Some(ToolExit {
                code: Some(1),
                success: false,
            });
        }
    }
}

impl ToolProcess for ScriptedProcess {
    fn next_event(&mut self) -> Pin<Box<dyn Future<Output = Option<ProcessEvent>> + Send + '_>> {
        Box::pin(async move {
            loop {
                if self.exit_delivered {
                    return None;
                }
                if let Some(exit) = self.exit {
                    self.exit_delivered = true;
                    return Some(ProcessEvent::Exited(exit));
                }
                let Some(step) = self.steps.front().cloned() else {
                    self.exit = Some(ToolExit {
                        code: Some(0),
                        success: true,
                    });
                    continue;
                };
                match step {
                    Step::Line(line) => {
                        self.steps.pop_front();
                        return Some(ProcessEvent::Line(line));
                    }
                    Step::Fragment { name, bytes } => {
                        self.steps.pop_front();
                        let path = self.work_dir.join(name);
                        self.write(path, &bytes);
                    }
                    Step::Output(bytes) => {
                        self.steps.pop_front();
                        let path = self.output.clone().unwrap_or_else(|| self.work_dir.join("output"));
                        self.write(path, &bytes);
                    }
                    Step::Sleep(d) => {
                        let until = *self.sleep_until.get_or_insert_with(|| Instant::now() + d);
                        tokio::time::sleep_until(until).await;
                        self.sleep_until = None;
                        self.steps.pop_front();
                    }
                    Step::Exit(code) => {
                        self.steps.pop_front();
                        self.exit = Some(ToolExit {
                            code: Some(code),
                            success: code == 0,
                        });
                    }
                    Step::Hang => std::future::pending::<()>().await,
                    Step::Panic(message) => panic!("{message}"),
                }
            }
        })
    }

    fn request_stop(&mut self) -> anyhow::Result<()> {
        self.stats.stop_requests.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_stop && self.exit.is_none() {
            self.exit = Some(ToolExit::killed());
        }
        Ok(())
    }

    fn kill(&mut self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.stats.kills.fetch_add(1, Ordering::SeqCst);
            if self.exit.is_none() {
                self.exit = Some(ToolExit::killed());
            }
            Ok(())
        })
    }

    fn wait(&mut self) -> Pin<Box<dyn Future<Output = anyhow::Result<ToolExit>> + Send + '_>> {
        Box::pin(async move {
            while let Some(event) = self.next_event().await {
                if let ProcessEvent::Exited(exit) = event {
                    return Ok(exit);
                }
            }
            Ok(self.exit.unwrap_or_else(ToolExit::killed))
        })
    }
}
