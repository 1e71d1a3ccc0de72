//! Staged simplification of medical report text.
//!
//! A run classifies the input first. Non-medical input ends the stream after the
//! classification preview with a single rejection fragment. Medical input goes through
//! four generation passes in fixed order, each fed the complete output of the previous
//! one, and the stream closes with the formatted output re-emitted as a final section.
//!
//! Streams are lazy: nothing runs until the first poll, and dropping the stream drops the
//! in-flight generation call with it. Persistence happens only when the consumer polls
//! past the last fragment.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::{
    classify::{ClassificationResult, Classifier, MedicalGuard, preview_fragments},
    error::Result,
    generate::{FragmentStream, Generator},
    report::{MedicalReport, ReportOwner, ReportStore},
};

pub const START_FRAGMENT: &str = "Starting simplification pipeline...\n";
pub const REJECTION_FRAGMENT: &str =
    "\nPlease provide a medical report. Simplification terminated.\n";
pub const DONE_FRAGMENT: &str = "\nDone!\n";
pub const FINAL_OUTPUT_HEADER: &str = "\n--- Final Simplified Output ---\n";

/// One generation pass of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Lexical,
    Syntactic,
    Summarization,
    Formatting,
}

impl Stage {
    /// Execution order
    pub const ALL: [Stage; 4] = [
        Stage::Lexical,
        Stage::Syntactic,
        Stage::Summarization,
        Stage::Formatting,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Lexical => "lexical",
            Stage::Syntactic => "syntactic",
            Stage::Summarization => "summarization",
            Stage::Formatting => "formatting",
        }
    }

    pub fn header(&self) -> &'static str {
        match self {
            Stage::Lexical => "\n\nStep 1: Lexical Simplification...\n",
            Stage::Syntactic => "\n\nStep 2: Syntactic Simplification...\n",
            Stage::Summarization => "\n\nStep 3: Dynamic Summarization...\n",
            Stage::Formatting => "\n\nStep 4: Formatting Output...\n",
        }
    }

    pub fn instruction(&self) -> &'static str {
        match self {
            Stage::Lexical => {
                "Translate complex medical jargons into plain English, keeping sentence structures the same."
            }
            Stage::Syntactic => "Simplify sentence structures while preserving meaning.",
            Stage::Summarization => {
                "Polish the text, fix grammar, and reorganize into clean readable flow."
            }
            Stage::Formatting => {
                "Format this summary for a patient-friendly medical report. Use bullet points or clear sections if helpful."
            }
        }
    }
}

/// Everything a single run produced so far
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimplificationRun {
    pub original: String,
    pub classification: Option<ClassificationResult>,
    pub lexical: Option<String>,
    pub syntactic: Option<String>,
    pub summarized: Option<String>,
    pub formatted: Option<String>,
}

impl SimplificationRun {
    pub fn new(original: impl Into<String>) -> Self {
        Self {
            original: original.into(),
            ..Default::default()
        }
    }

    pub fn output(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Lexical => self.lexical.as_deref(),
            Stage::Syntactic => self.syntactic.as_deref(),
            Stage::Summarization => self.summarized.as_deref(),
            Stage::Formatting => self.formatted.as_deref(),
        }
    }

    fn record(&mut self, stage: Stage, output: String) {
        let slot = match stage {
            Stage::Lexical => &mut self.lexical,
            Stage::Syntactic => &mut self.syntactic,
            Stage::Summarization => &mut self.summarized,
            Stage::Formatting => &mut self.formatted,
        };
        *slot = Some(output);
    }

    /// Input of `stage`: the original text for the first pass, else the previous output
    fn input_for(&self, index: usize) -> &str {
        match index.checked_sub(1) {
            None => &self.original,
            Some(previous) => self.output(Stage::ALL[previous]).unwrap_or_default(),
        }
    }

    pub fn final_output(&self) -> Option<&str> {
        self.formatted.as_deref()
    }

    pub fn is_rejected(&self) -> bool {
        self.classification
            .as_ref()
            .is_some_and(|result| !result.is_medical())
    }

    pub fn to_report(&self, owner: ReportOwner, date_created: DateTime<Utc>) -> MedicalReport {
        MedicalReport {
            user_id: owner.user_id,
            report_id: owner.report_id,
            user_email: owner.user_email,
            original_report: self.original.clone(),
            simplified_report: trimmed(self.summarized.as_deref()),
            formatted_simplified_report: trimmed(self.formatted.as_deref()),
            date_created,
        }
    }
}

/// Stored form of a stage output: surrounding whitespace dropped
fn trimmed(output: Option<&str>) -> String {
    output.unwrap_or_default().trim().to_string()
}

/// Classification + four generation passes over a report
#[derive(Clone)]
pub struct SimplificationPipeline {
    guard: MedicalGuard,
    generator: Arc<dyn Generator>,
    reports: Arc<dyn ReportStore>,
}

impl SimplificationPipeline {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        generator: Arc<dyn Generator>,
        reports: Arc<dyn ReportStore>,
    ) -> Self {
        Self {
            guard: MedicalGuard::new(classifier),
            generator,
            reports,
        }
    }

    pub fn reports(&self) -> &Arc<dyn ReportStore> {
        &self.reports
    }

    pub async fn classify(&self, text: &str) -> Result<ClassificationResult> {
        self.guard.classify(text).await
    }

    pub async fn is_medical(&self, text: &str) -> Result<bool> {
        self.guard.is_medical(text).await
    }

    /// Only the classification preview, no generation
    pub fn stream_classification(&self, text: impl Into<String>) -> FragmentStream {
        self.start(text.into(), Mode::PreviewOnly)
    }

    pub fn stream_simplify(&self, text: impl Into<String>) -> FragmentStream {
        self.start(text.into(), Mode::Simplify { owner: None })
    }

    /// Like [`Self::stream_simplify`]; a completed run over medical input is saved
    pub fn stream_and_persist(&self, text: impl Into<String>, owner: ReportOwner) -> FragmentStream {
        self.start(text.into(), Mode::Simplify { owner: Some(owner) })
    }

    fn start(&self, text: String, mode: Mode) -> FragmentStream {
        let (preview_only, owner) = match mode {
            Mode::PreviewOnly => (true, None),
            Mode::Simplify { owner } => (false, owner),
        };
        let run = RunState {
            guard: self.guard.clone(),
            generator: self.generator.clone(),
            reports: self.reports.clone(),
            owner,
            preview_only,
            run: SimplificationRun::new(text),
            phase: Phase::Start,
            pending: VecDeque::new(),
        };

        Box::pin(futures::stream::unfold(run, |mut run| async move {
            run.next_fragment().await.map(|item| (item, run))
        }))
    }
}

enum Mode {
    PreviewOnly,
    Simplify { owner: Option<ReportOwner> },
}

enum Phase {
    Start,
    Classify,
    StageHeader(usize),
    StageOpen(usize),
    Streaming {
        index: usize,
        fragments: FragmentStream,
        output: String,
    },
    Persist,
    Finished,
}

struct RunState {
    guard: MedicalGuard,
    generator: Arc<dyn Generator>,
    reports: Arc<dyn ReportStore>,
    owner: Option<ReportOwner>,
    preview_only: bool,
    run: SimplificationRun,
    phase: Phase,
    pending: VecDeque<String>,
}

impl RunState {
    /// Advance until one fragment is available. Any error ends the run.
    async fn next_fragment(&mut self) -> Option<Result<String>> {
        loop {
            if let Some(fragment) = self.pending.pop_front() {
                return Some(Ok(fragment));
            }

            match std::mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Start => {
                    if !self.preview_only {
                        self.pending.push_back(START_FRAGMENT.to_string());
                    }
                    self.phase = Phase::Classify;
                }
                Phase::Classify => {
                    let result = match self.guard.classify(&self.run.original).await {
                        Ok(result) => result,
                        Err(e) => {
                            error!("Classification failed: {}", e);
                            return Some(Err(e));
                        }
                    };
                    self.pending.extend(preview_fragments(&result));
                    let medical = result.is_medical();
                    self.run.classification = Some(result);

                    if self.preview_only {
                        continue;
                    }
                    if !medical {
                        info!("Input rejected as non-medical, simplification terminated");
                        self.pending.push_back(REJECTION_FRAGMENT.to_string());
                        continue;
                    }
                    self.phase = Phase::StageHeader(0);
                }
                Phase::StageHeader(index) => {
                    self.pending.push_back(Stage::ALL[index].header().to_string());
                    self.phase = Phase::StageOpen(index);
                }
                Phase::StageOpen(index) => {
                    let stage = Stage::ALL[index];
                    let input = self.run.input_for(index).to_string();
                    debug!(stage = stage.name(), input_chars = input.len(), "starting stage");

                    match self.generator.stream(&input, stage.instruction()).await {
                        Ok(fragments) => {
                            self.phase = Phase::Streaming {
                                index,
                                fragments,
                                output: String::new(),
                            };
                        }
                        Err(e) => {
                            error!(stage = stage.name(), "Generation failed: {}", e);
                            return Some(Err(e));
                        }
                    }
                }
                Phase::Streaming {
                    index,
                    mut fragments,
                    mut output,
                } => match fragments.next().await {
                    Some(Ok(fragment)) => {
                        output.push_str(&fragment);
                        self.phase = Phase::Streaming {
                            index,
                            fragments,
                            output,
                        };
                        if !fragment.is_empty() {
                            return Some(Ok(fragment));
                        }
                    }
                    Some(Err(e)) => {
                        error!(stage = Stage::ALL[index].name(), "Generation failed: {}", e);
                        return Some(Err(e));
                    }
                    None => {
                        let stage = Stage::ALL[index];
                        info!(stage = stage.name(), output_chars = output.len(), "stage completed");
                        if output.trim().is_empty() {
                            warn!(stage = stage.name(), "stage produced no text");
                        }
                        self.run.record(stage, output);

                        if index + 1 < Stage::ALL.len() {
                            self.phase = Phase::StageHeader(index + 1);
                        } else {
                            let formatted = self.run.final_output().unwrap_or_default().to_string();
                            self.pending.push_back(DONE_FRAGMENT.to_string());
                            self.pending.push_back(FINAL_OUTPUT_HEADER.to_string());
                            self.pending.push_back(formatted);
                            self.phase = Phase::Persist;
                        }
                    }
                },
                Phase::Persist => {
                    if let Some(owner) = self.owner.take() {
                        let report_id = owner.report_id.clone();
                        let report = self.run.to_report(owner, Utc::now());
                        if let Err(e) = self.reports.save(report).await {
                            error!(report_id = %report_id, "Failed to persist report: {}", e);
                            return Some(Err(e));
                        }
                        info!(report_id = %report_id, "Simplified report persisted");
                    }
                }
                Phase::Finished => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use crate::report::InMemoryReportStore;
    use crate::testing::{FixedClassifier, GeneratorCall, ScriptedGenerator, StreamScript};

    fn owner() -> ReportOwner {
        ReportOwner {
            user_id: "user-1".to_string(),
            report_id: "report-1".to_string(),
            user_email: "pat@example.com".to_string(),
        }
    }

    fn four_stage_generator() -> Arc<ScriptedGenerator> {
        let generator = ScriptedGenerator::new();
        generator.push_stream(StreamScript::fragments(["Patient says ", "no chest pain."]));
        generator.push_stream(StreamScript::fragments(["No chest pain. ", "Stable."]));
        generator.push_stream(StreamScript::fragments(["You have no chest pain and are stable."]));
        generator.push_stream(StreamScript::fragments(["- No chest pain\n", "- Stable, sent home"]));
        Arc::new(generator)
    }

    fn pipeline(
        classifier: FixedClassifier,
        generator: Arc<ScriptedGenerator>,
        reports: Arc<InMemoryReportStore>,
    ) -> SimplificationPipeline {
        SimplificationPipeline::new(Arc::new(classifier), generator, reports)
    }

    async fn collect(stream: FragmentStream) -> Vec<Result<String>> {
        stream.collect().await
    }

    fn texts(items: &[Result<String>]) -> Vec<String> {
        items
            .iter()
            .map(|item| item.as_ref().expect("fragment").clone())
            .collect()
    }

    #[tokio::test]
    async fn non_medical_input_ends_after_single_rejection() {
        let generator = Arc::new(ScriptedGenerator::new());
        let reports = Arc::new(InMemoryReportStore::new());
        let pipeline = pipeline(FixedClassifier::non_medical(), generator.clone(), reports.clone());

        let fragments = texts(&collect(pipeline.stream_and_persist("lol what's up", owner())).await);

        // start + header + "Top Predictions" + 3 labels + verdict + rejection
        assert_eq!(fragments.len(), 8);
        assert_eq!(fragments.last().unwrap(), REJECTION_FRAGMENT);
        assert_eq!(
            fragments.iter().filter(|f| f.as_str() == REJECTION_FRAGMENT).count(),
            1
        );
        assert!(generator.calls().is_empty());
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn medical_input_chains_stage_outputs_in_order() {
        let generator = four_stage_generator();
        let reports = Arc::new(InMemoryReportStore::new());
        let pipeline = pipeline(FixedClassifier::medical(), generator.clone(), reports);
        let original = "Patient denies chest pain, vitals stable, discharged home";

        let fragments = texts(&collect(pipeline.stream_simplify(original)).await);

        let streams: Vec<(String, String)> = generator
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                GeneratorCall::Stream { prompt, instruction } => Some((prompt, instruction)),
                _ => None,
            })
            .collect();
        assert_eq!(streams.len(), 4);
        assert_eq!(streams[0].0, original);
        assert_eq!(streams[1].0, "Patient says no chest pain.");
        assert_eq!(streams[2].0, "No chest pain. Stable.");
        assert_eq!(streams[3].0, "You have no chest pain and are stable.");
        for (call, stage) in streams.iter().zip(Stage::ALL) {
            assert_eq!(call.1, stage.instruction());
        }

        let header_positions: Vec<usize> = Stage::ALL
            .iter()
            .map(|stage| fragments.iter().position(|f| f == stage.header()).unwrap())
            .collect();
        assert!(header_positions.windows(2).all(|w| w[0] < w[1]));

        let n = fragments.len();
        assert_eq!(fragments[n - 3], DONE_FRAGMENT);
        assert_eq!(fragments[n - 2], FINAL_OUTPUT_HEADER);
        assert_eq!(fragments[n - 1], "- No chest pain\n- Stable, sent home");
        assert_ne!(fragments[n - 1], original);
    }

    #[tokio::test]
    async fn completed_medical_run_is_persisted_once() {
        let generator = four_stage_generator();
        let reports = Arc::new(InMemoryReportStore::new());
        let pipeline = pipeline(FixedClassifier::medical(), generator, reports.clone());

        let items = collect(pipeline.stream_and_persist("BP 120/80, afebrile", owner())).await;
        assert!(items.iter().all(|item| item.is_ok()));

        let saved = reports.list_for_user("user-1").await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].report_id, "report-1");
        assert_eq!(saved[0].user_email, "pat@example.com");
        assert_eq!(saved[0].original_report, "BP 120/80, afebrile");
        assert_eq!(saved[0].simplified_report, "You have no chest pain and are stable.");
        assert_eq!(
            saved[0].formatted_simplified_report,
            "- No chest pain\n- Stable, sent home"
        );
    }

    #[tokio::test]
    async fn abandoned_stream_writes_nothing() {
        let generator = four_stage_generator();
        let reports = Arc::new(InMemoryReportStore::new());
        let pipeline = pipeline(FixedClassifier::medical(), generator, reports.clone());

        let mut stream = pipeline.stream_and_persist("Hb 13.2 g/dL", owner());
        for _ in 0..10 {
            stream.next().await.unwrap().unwrap();
        }
        drop(stream);

        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn stream_consumed_up_to_final_fragment_is_not_yet_persisted() {
        let generator = four_stage_generator();
        let reports = Arc::new(InMemoryReportStore::new());
        let pipeline = pipeline(FixedClassifier::medical(), generator, reports.clone());

        let mut stream = pipeline.stream_and_persist("Hb 13.2 g/dL", owner());
        let mut last = String::new();
        while last != FINAL_OUTPUT_HEADER {
            last = stream.next().await.unwrap().unwrap();
        }
        stream.next().await.unwrap().unwrap();
        assert!(reports.is_empty());

        assert!(stream.next().await.is_none());
        assert_eq!(reports.len(), 1);
    }

    #[tokio::test]
    async fn generation_failure_aborts_without_persisting() {
        let generator = ScriptedGenerator::new();
        generator.push_stream(StreamScript::fragments(["plain words"]));
        generator.push_stream(StreamScript::fail_after(["half a"], "upstream reset"));
        let generator = Arc::new(generator);
        let reports = Arc::new(InMemoryReportStore::new());
        let pipeline = pipeline(FixedClassifier::medical(), generator.clone(), reports.clone());

        let items = collect(pipeline.stream_and_persist("CRP elevated", owner())).await;

        let last = items.last().unwrap();
        assert!(matches!(last, Err(FlowError::GenerationFailed(_))));
        assert!(items[..items.len() - 1].iter().all(|item| item.is_ok()));
        assert_eq!(generator.calls().len(), 2);
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn classification_failure_is_fatal() {
        let generator = Arc::new(ScriptedGenerator::new());
        let reports = Arc::new(InMemoryReportStore::new());
        let pipeline = pipeline(FixedClassifier::failing(), generator.clone(), reports);

        let items = collect(pipeline.stream_simplify("anything")).await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), START_FRAGMENT);
        assert!(matches!(items[1], Err(FlowError::ClassificationFailed(_))));
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn classification_preview_stops_before_generation() {
        let generator = Arc::new(ScriptedGenerator::new());
        let reports = Arc::new(InMemoryReportStore::new());
        let pipeline = pipeline(FixedClassifier::medical(), generator.clone(), reports);

        let fragments = texts(&collect(pipeline.stream_classification("ECG normal")).await);

        assert_eq!(fragments.last().unwrap(), "\nThis looks like a medical report.\n");
        assert!(!fragments.iter().any(|f| f == START_FRAGMENT));
        assert!(!fragments.iter().any(|f| f == REJECTION_FRAGMENT));
        assert!(generator.calls().is_empty());
    }

    #[test]
    fn report_takes_summarized_and_formatted_outputs() {
        let mut run = SimplificationRun::new("orig");
        run.record(Stage::Lexical, "lex".into());
        run.record(Stage::Summarization, "sum".into());
        run.record(Stage::Formatting, "fmt".into());

        let report = run.to_report(owner(), Utc::now());
        assert_eq!(report.simplified_report, "sum");
        assert_eq!(report.formatted_simplified_report, "fmt");
        assert_eq!(run.input_for(1), "lex");
        assert_eq!(run.input_for(0), "orig");
    }

    #[test]
    fn stored_outputs_are_trimmed() {
        let mut run = SimplificationRun::new("orig");
        run.record(Stage::Summarization, "\n  You are well.  \n".into());
        run.record(Stage::Formatting, "\n- Well\n\n".into());

        let report = run.to_report(owner(), Utc::now());
        assert_eq!(report.simplified_report, "You are well.");
        assert_eq!(report.formatted_simplified_report, "- Well");
        assert_eq!(run.final_output(), Some("\n- Well\n\n"));
    }
}
