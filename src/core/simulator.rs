use crate::core::model::{Course, Progress, Severity};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    /// Pause before each simulated file.
    pub tick: Duration,
    /// Chance of a synthetic warning per file, in `0.0..=1.0`.
    pub warning_probability: f64,
    /// Fixed seed for the warning draw; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { tick: Duration::from_millis(50), warning_probability: 0.05, seed: None }
    }
}

/// Where simulated events go. Mirrors what the backend would push over the channel.
#[async_trait]
pub trait SimulationSink: Send + Sync {
    async fn progress(&self, progress: Progress);
    async fn log(&self, message: String, severity: Severity);
    async fn complete(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationOutcome {
    Completed,
    Stopped,
}

pub struct SimulatedEngine {
    config: SimulationConfig,
    rng: StdRng,
}

impl SimulatedEngine {
    pub fn new(config: SimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    pub fn total_files(courses: &[Course]) -> u64 {
        courses.iter().map(|c| c.file_count).sum()
    }

    /// Plays a download of `courses` in order. The stop token is honoured at
    /// every tick, so a stop lands within one tick.
    pub async fn run(
        &mut self,
        courses: &[Course],
        sink: &dyn SimulationSink,
        stop: &CancellationToken,
    ) -> SimulationOutcome {
        let total = Self::total_files(courses);
        let warn_p = self.config.warning_probability.clamp(0.0, 1.0);

        sink.progress(Progress { current: 0, total, current_file: String::new() }).await;
        sink.log(
            format!("Starting demo download of {} courses ({} files)", courses.len(), total),
            Severity::Info,
        )
        .await;

        let mut current = 0u64;
        for course in courses {
            if stop.is_cancelled() {
                return SimulationOutcome::Stopped;
            }
            sink.log(format!("Processing course: {}", course.name), Severity::Info).await;

            for index in 1..=course.file_count {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return SimulationOutcome::Stopped,
                    _ = sleep(self.config.tick) => {}
                }

                current += 1;
                let file_name = format!("file_{index}.pdf");
                let current_file = format!("{}/{file_name}", course.code);
                sink.progress(Progress { current, total, current_file }).await;

                if self.rng.gen_bool(warn_p) {
                    sink.log(format!("Warning: Simulated issue with {file_name}"), Severity::Warning)
                        .await;
                }
            }

            sink.log(format!("Completed downloading {}", course.name), Severity::Success).await;
        }

        if stop.is_cancelled() {
            return SimulationOutcome::Stopped;
        }
        sink.complete().await;
        sink.log(
            "Demo download completed! Start the backend for real downloads.".to_string(),
            Severity::Success,
        )
        .await;
        SimulationOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Term;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Progress(Progress),
        Log(String, Severity),
        Complete,
    }

    #[derive(Default, Clone)]
    struct Recorder {
        seen: Arc<Mutex<Vec<Seen>>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SimulationSink for Recorder {
        async fn progress(&self, progress: Progress) {
            self.seen.lock().unwrap().push(Seen::Progress(progress));
        }
        async fn log(&self, message: String, severity: Severity) {
            self.seen.lock().unwrap().push(Seen::Log(message, severity));
        }
        async fn complete(&self) {
            self.seen.lock().unwrap().push(Seen::Complete);
        }
    }

    fn course(id: i64, code: &str, file_count: u64) -> Course {
        Course {
            id,
            name: format!("{code} course"),
            code: code.to_string(),
            term: Term::default(),
            file_count,
            folder_count: 1,
        }
    }

    fn quiet() -> SimulationConfig {
        SimulationConfig { warning_probability: 0.0, seed: Some(7), ..Default::default() }
    }

    #[tokio::test(start_paused = true)]
    async fn two_files_follow_a_zeroed_opening_progress() {
        let courses = vec![course(1, "CS101", 2)];
        assert_eq!(SimulatedEngine::total_files(&courses), 2);

        let sink = Recorder::default();
        let outcome = SimulatedEngine::new(quiet()).run(&courses, &sink, &CancellationToken::new()).await;
        assert_eq!(outcome, SimulationOutcome::Completed);

        let progress: Vec<Progress> = sink
            .take()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Progress(p) => Some(p),
                _ => None,
            })
            .collect();
        // a zeroed counter announces the total before the first file
        assert_eq!(
            progress,
            vec![
                Progress { current: 0, total: 2, current_file: String::new() },
                Progress { current: 1, total: 2, current_file: "CS101/file_1.pdf".into() },
                Progress { current: 2, total: 2, current_file: "CS101/file_2.pdf".into() },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn file_names_keep_the_course_code_verbatim() {
        let courses = vec![course(1, "MATH 101/201", 1)];
        let sink = Recorder::default();
        SimulatedEngine::new(quiet()).run(&courses, &sink, &CancellationToken::new()).await;

        let files: Vec<String> = sink
            .take()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Progress(p) if p.current > 0 => Some(p.current_file),
                _ => None,
            })
            .collect();
        assert_eq!(files, vec!["MATH 101/201/file_1.pdf".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn logs_bracket_each_course_and_completion_precedes_final_log() {
        let courses = vec![course(1, "A1", 1), course(2, "B2", 0)];
        let sink = Recorder::default();
        SimulatedEngine::new(quiet()).run(&courses, &sink, &CancellationToken::new()).await;

        let seen = sink.take();
        let logs: Vec<&str> = seen
            .iter()
            .filter_map(|s| match s {
                Seen::Log(m, _) => Some(m.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(logs[1], "Processing course: A1 course");
        assert_eq!(logs[2], "Completed downloading A1 course");
        assert_eq!(logs[3], "Processing course: B2 course");
        assert_eq!(logs[4], "Completed downloading B2 course");
        let complete_at = seen.iter().position(|s| *s == Seen::Complete).unwrap();
        assert_eq!(complete_at, seen.len() - 2);
    }

    #[tokio::test(start_paused = true)]
    async fn seeded_warnings_are_reproducible() {
        let courses = vec![course(1, "CS101", 40)];
        let cfg = SimulationConfig { warning_probability: 0.5, seed: Some(42), ..Default::default() };

        let a = Recorder::default();
        SimulatedEngine::new(cfg.clone()).run(&courses, &a, &CancellationToken::new()).await;
        let b = Recorder::default();
        SimulatedEngine::new(cfg).run(&courses, &b, &CancellationToken::new()).await;

        assert_eq!(a.take(), b.take());
        assert!(a.take().iter().any(|s| matches!(s, Seen::Log(_, Severity::Warning))));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_observed_at_the_next_tick() {
        let courses = vec![course(1, "CS101", 100)];
        let sink = Recorder::default();
        let stop = CancellationToken::new();

        let task = {
            let sink = sink.clone();
            let stop = stop.clone();
            tokio::spawn(async move { SimulatedEngine::new(quiet()).run(&courses, &sink, &stop).await })
        };
        sleep(Duration::from_millis(175)).await;
        stop.cancel();

        assert_eq!(task.await.unwrap(), SimulationOutcome::Stopped);
        let seen = sink.take();
        assert!(!seen.contains(&Seen::Complete));
        let last = seen
            .iter()
            .rev()
            .find_map(|s| match s {
                Seen::Progress(p) => Some(p.current),
                _ => None,
            })
            .unwrap();
        assert!(last <= 4, "engine kept running after stop: {last}");
    }
}
