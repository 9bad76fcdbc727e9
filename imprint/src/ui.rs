use anyhow::{Result, anyhow, bail};
use console::style;
use dialoguer::{Confirm, MultiSelect, theme::ColorfulTheme};
use imprint_core::state::Phase;
use imprint_core::{ProgressEvent, TargetDevice};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{IsTerminal, stdout};
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// Disabling it keeps the progress bars intact when the user cancels; the
/// original terminal state is restored when this struct is dropped.
pub struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    pub fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }
            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

/// Presents an interactive menu for the user to pick one or more devices.
pub fn select_devices(devices: &[TargetDevice], prompt: &str) -> Result<Vec<TargetDevice>> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    let chosen = MultiSelect::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .interact()?;
    if chosen.is_empty() {
        bail!("No device selected.");
    }
    Ok(chosen.into_iter().map(|i| devices[i].clone()).collect())
}

/// Presents a final "Yes/No" confirmation to the user.
pub fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(confirmation)
}

pub fn bar_style(colour: &str) -> ProgressStyle {
    let template = format!(
        "{{prefix:16}} {{msg:10}} [{{elapsed_precise}}] [{{bar:40.{colour}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
    );
    ProgressStyle::default_bar()
        .template(&template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("■ ")
}

pub fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:16} [{elapsed_precise}] {spinner} {bytes} ({bytes_per_sec}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Pending => "waiting",
        Phase::Writing => "writing",
        Phase::Paused => "cooling",
        Phase::WrittenPendingVerification => "written",
        Phase::Verifying => "verifying",
        Phase::Completed => "done",
        Phase::Failed => "failed",
        Phase::Aborted => "stopped",
    }
}

/// One progress bar per device, driven by the job's progress events.
pub struct JobBars {
    multi: MultiProgress,
    bars: HashMap<String, (ProgressBar, Phase)>,
}

impl JobBars {
    pub fn new(devices: &[TargetDevice], total: u64) -> Self {
        let multi = MultiProgress::new();
        let bars = devices
            .iter()
            .map(|d| {
                let pb = multi.add(ProgressBar::new(total));
                pb.set_style(bar_style("green"));
                pb.set_prefix(d.name.clone());
                pb.set_message(phase_label(Phase::Pending));
                pb.enable_steady_tick(Duration::from_millis(250));
                (d.id(), (pb, Phase::Pending))
            })
            .collect();
        Self { multi, bars }
    }

    pub fn update(&mut self, event: &ProgressEvent) {
        let Some((pb, shown)) = self.bars.get_mut(&event.device) else {
            return;
        };
        if *shown != event.phase {
            if event.phase == Phase::Verifying {
                pb.set_style(bar_style("magenta"));
                pb.reset_eta();
            }
            if event.phase == Phase::Paused {
                pb.set_style(bar_style("yellow"));
            } else if *shown == Phase::Paused && event.phase == Phase::Writing {
                pb.set_style(bar_style("green"));
            }
            pb.set_message(phase_label(event.phase));
            *shown = event.phase;
        }
        pb.set_length(event.bytes_total);
        let position = match event.phase {
            Phase::Verifying => event.bytes_verified,
            _ => event.bytes_written,
        };
        pb.set_position(position);
        if event.phase.is_terminal() {
            pb.disable_steady_tick();
            pb.finish();
        }
    }

    /// Runs `f` with the bars hidden, so printed lines don't tear them.
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.multi.suspend(f)
    }

    pub fn finish(&self) {
        for (pb, _) in self.bars.values() {
            if !pb.is_finished() {
                pb.abandon();
            }
        }
    }
}

pub fn print_warning(devices: &[TargetDevice], image: &std::path::Path) {
    println!(
        "{} This will erase all data on {} device(s):",
        style("WARNING:").red().bold(),
        devices.len()
    );
    for device in devices {
        println!("  Device: {}", style(device).cyan());
    }
    println!("  Image:  {}", style(image.display()).cyan());
    println!();
}
