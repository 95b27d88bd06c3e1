//! Reducer-style workflow session: every external event (user action,
//! provider response, failure) is applied as a discrete message, and the
//! reducer answers with the follow-up calls to issue. Provider responses
//! carry the request token they were issued under; a token that no longer
//! matches the live session means the response is stale and is dropped.

use crate::pipeline::{RefinementRequest, RefinementResult, TranslationResult, VerificationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Translation,
    Verification,
    Refinement,
    Audio,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Translation => "translation",
            FailureKind::Verification => "verification",
            FailureKind::Refinement => "refinement",
            FailureKind::Audio => "audio",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Translating,
    TranslationReady,
    Verifying,
    VerificationReady,
    RefinementPending,
    RefinementReady,
    GeneratingAudio,
    AudioReady,
    Failed(FailureKind),
}

/// Events fed into the reducer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    TranslateRequested {
        source_text: String,
        target_language: String,
    },
    TranslationSucceeded {
        seq: u64,
        result: TranslationResult,
    },
    TranslationFailed {
        seq: u64,
        error: String,
    },
    VerificationSucceeded {
        seq: u64,
        text_version: u64,
        result: VerificationResult,
    },
    VerificationFailed {
        seq: u64,
        text_version: u64,
        error: String,
    },
    RefinementRequested {
        feedback: String,
    },
    RefinementSucceeded {
        seq: u64,
        result: RefinementResult,
    },
    RefinementFailed {
        seq: u64,
        error: String,
    },
    RefinementAccepted,
    RefinementDiscarded,
    TranslationEdited {
        new_text: String,
    },
    AudioRequested,
    AudioSucceeded {
        seq: u64,
        audio_url: String,
    },
    AudioFailed {
        seq: u64,
        error: String,
    },
    Restarted,
}

/// Follow-up calls the driving layer must issue. Each carries the token(s)
/// its eventual response event must echo back.
#[derive(Debug, Clone)]
pub enum Command {
    Translate {
        seq: u64,
        source_text: String,
        target_language: String,
    },
    Verify {
        seq: u64,
        text_version: u64,
        translated_text: String,
        target_language: String,
    },
    Refine {
        seq: u64,
        request: RefinementRequest,
    },
    SynthesizeAudio {
        seq: u64,
        text: String,
        language: String,
    },
}

#[derive(Debug)]
pub struct WorkflowSession {
    status: Status,
    seq: u64,
    text_version: u64,
    source_text: String,
    target_language: String,
    translation: Option<TranslationResult>,
    verification: Option<VerificationResult>,
    refinement: Option<RefinementResult>,
    audio_url: Option<String>,
    last_error: Option<String>,
}

impl Default for WorkflowSession {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            seq: 0,
            text_version: 0,
            source_text: String::new(),
            target_language: String::new(),
            translation: None,
            verification: None,
            refinement: None,
            audio_url: None,
            last_error: None,
        }
    }
}

impl WorkflowSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn text_version(&self) -> u64 {
        self.text_version
    }

    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    pub fn target_language(&self) -> &str {
        &self.target_language
    }

    pub fn translation(&self) -> Option<&TranslationResult> {
        self.translation.as_ref()
    }

    pub fn verification(&self) -> Option<&VerificationResult> {
        self.verification.as_ref()
    }

    pub fn refinement(&self) -> Option<&RefinementResult> {
        self.refinement.as_ref()
    }

    pub fn audio_url(&self) -> Option<&str> {
        self.audio_url.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn apply(&mut self, event: SessionEvent) -> Vec<Command> {
        match event {
            SessionEvent::TranslateRequested {
                source_text,
                target_language,
            } => self.on_translate_requested(source_text, target_language),
            SessionEvent::TranslationSucceeded { seq, result } => {
                if seq != self.seq {
                    return Vec::new();
                }
                self.on_translation_succeeded(result)
            }
            SessionEvent::TranslationFailed { seq, error } => {
                if seq != self.seq {
                    return Vec::new();
                }
                self.fail(FailureKind::Translation, error)
            }
            SessionEvent::VerificationSucceeded {
                seq,
                text_version,
                result,
            } => {
                if seq != self.seq || text_version != self.text_version {
                    return Vec::new();
                }
                self.verification = Some(result);
                if self.status == Status::Verifying {
                    self.status = Status::VerificationReady;
                }
                Vec::new()
            }
            SessionEvent::VerificationFailed {
                seq,
                text_version,
                error,
            } => {
                if seq != self.seq || text_version != self.text_version {
                    return Vec::new();
                }
                // The translation stays committed; only the check failed.
                self.fail(FailureKind::Verification, error)
            }
            SessionEvent::RefinementRequested { feedback } => self.on_refinement_requested(feedback),
            SessionEvent::RefinementSucceeded { seq, result } => {
                if seq != self.seq {
                    return Vec::new();
                }
                self.refinement = Some(result);
                self.status = Status::RefinementReady;
                Vec::new()
            }
            SessionEvent::RefinementFailed { seq, error } => {
                if seq != self.seq {
                    return Vec::new();
                }
                self.fail(FailureKind::Refinement, error)
            }
            SessionEvent::RefinementAccepted => self.on_refinement_accepted(),
            SessionEvent::RefinementDiscarded => {
                self.refinement = None;
                if self.translation.is_some() {
                    self.status = self.ready_status();
                }
                Vec::new()
            }
            SessionEvent::TranslationEdited { new_text } => self.on_translation_edited(new_text),
            SessionEvent::AudioRequested => self.on_audio_requested(),
            SessionEvent::AudioSucceeded { seq, audio_url } => {
                if seq != self.seq {
                    return Vec::new();
                }
                self.audio_url = Some(audio_url);
                self.status = Status::AudioReady;
                Vec::new()
            }
            SessionEvent::AudioFailed { seq, error } => {
                if seq != self.seq {
                    return Vec::new();
                }
                // Audio failure must not cost the user their translation:
                // surface the error and fall back to the prior ready state.
                self.last_error = Some(error);
                self.status = self.ready_status();
                Vec::new()
            }
            SessionEvent::Restarted => {
                let seq = self.seq + 1;
                *self = WorkflowSession::default();
                self.seq = seq;
                Vec::new()
            }
        }
    }

    fn on_translate_requested(
        &mut self,
        source_text: String,
        target_language: String,
    ) -> Vec<Command> {
        if source_text.trim().is_empty() || target_language.trim().is_empty() {
            self.last_error = Some("source text and target language are required".to_string());
            return Vec::new();
        }
        // Supersedes any in-flight request: the bumped token makes the old
        // response stale on arrival.
        self.seq += 1;
        self.source_text = source_text.trim().to_string();
        self.target_language = target_language.trim().to_string();
        self.translation = None;
        self.verification = None;
        self.refinement = None;
        self.audio_url = None;
        self.last_error = None;
        self.status = Status::Translating;
        vec![Command::Translate {
            seq: self.seq,
            source_text: self.source_text.clone(),
            target_language: self.target_language.clone(),
        }]
    }

    fn on_translation_succeeded(&mut self, result: TranslationResult) -> Vec<Command> {
        let translated_text = result.translation.clone();
        self.translation = Some(result);
        self.text_version += 1;
        self.verification = None;
        self.status = Status::Verifying;
        // Verification is only issued once the translation is committed.
        vec![Command::Verify {
            seq: self.seq,
            text_version: self.text_version,
            translated_text,
            target_language: self.target_language.clone(),
        }]
    }

    fn on_refinement_requested(&mut self, feedback: String) -> Vec<Command> {
        let Some(translation) = self.translation.as_ref() else {
            self.last_error = Some("nothing to refine yet".to_string());
            return Vec::new();
        };
        if feedback.trim().is_empty() {
            self.last_error = Some("refinement feedback must not be empty".to_string());
            return Vec::new();
        }
        let analysis = translation.analysis_summary();
        let request = RefinementRequest {
            source_text: self.source_text.clone(),
            current_translation: translation.translation.clone(),
            target_language: self.target_language.clone(),
            user_feedback: feedback.trim().to_string(),
            prior_analysis_context: (!analysis.is_empty()).then_some(analysis),
        };
        self.status = Status::RefinementPending;
        vec![Command::Refine {
            seq: self.seq,
            request,
        }]
    }

    fn on_refinement_accepted(&mut self) -> Vec<Command> {
        let Some(refinement) = self.refinement.take() else {
            return Vec::new();
        };
        let Some(translation) = self.translation.as_mut() else {
            return Vec::new();
        };
        translation.translation = refinement.revised_translation;
        self.commit_new_text()
    }

    fn on_translation_edited(&mut self, new_text: String) -> Vec<Command> {
        if new_text.trim().is_empty() {
            self.last_error = Some("edited translation must not be empty".to_string());
            return Vec::new();
        }
        let Some(translation) = self.translation.as_mut() else {
            return Vec::new();
        };
        translation.translation = new_text.trim().to_string();
        self.commit_new_text()
    }

    /// The committed translation text changed: prior verification no longer
    /// applies and the new text must be re-checked.
    fn commit_new_text(&mut self) -> Vec<Command> {
        self.text_version += 1;
        self.verification = None;
        self.audio_url = None;
        self.status = Status::Verifying;
        let translated_text = self
            .translation
            .as_ref()
            .map(|translation| translation.translation.clone())
            .unwrap_or_default();
        vec![Command::Verify {
            seq: self.seq,
            text_version: self.text_version,
            translated_text,
            target_language: self.target_language.clone(),
        }]
    }

    fn on_audio_requested(&mut self) -> Vec<Command> {
        let Some(translation) = self.translation.as_ref() else {
            self.last_error = Some("no translation to synthesize".to_string());
            return Vec::new();
        };
        self.status = Status::GeneratingAudio;
        vec![Command::SynthesizeAudio {
            seq: self.seq,
            text: translation.translation.clone(),
            language: self.target_language.clone(),
        }]
    }

    fn fail(&mut self, kind: FailureKind, error: String) -> Vec<Command> {
        self.last_error = Some(error);
        self.status = Status::Failed(kind);
        Vec::new()
    }

    /// Where a translation-holding session settles when nothing is pending.
    fn ready_status(&self) -> Status {
        if self.verification.is_some() {
            Status::VerificationReady
        } else {
            Status::TranslationReady
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translation(text: &str) -> TranslationResult {
        TranslationResult {
            translation: text.to_string(),
            cultural_notes: "Formal register.".to_string(),
            intent: Some("Medication instruction.".to_string()),
            cultural_considerations: None,
            strategy: None,
            model: None,
            usage: None,
        }
    }

    fn verification() -> VerificationResult {
        VerificationResult {
            literal_translation: "Please take your medication with food.".to_string(),
            perceived_tone: "Polite.".to_string(),
            cultural_nuance: String::new(),
            overall_assessment: "Reads well.".to_string(),
            model: None,
            usage: None,
        }
    }

    fn refinement(text: &str) -> RefinementResult {
        RefinementResult {
            revised_translation: text.to_string(),
            changes_explanation: "More formal.".to_string(),
            improvement_notes: String::new(),
            model: None,
            usage: None,
        }
    }

    fn session_with_translation() -> (WorkflowSession, u64) {
        let mut session = WorkflowSession::new();
        session.apply(SessionEvent::TranslateRequested {
            source_text: "Please take your medication with food.".to_string(),
            target_language: "Spanish".to_string(),
        });
        let seq = session.seq();
        session.apply(SessionEvent::TranslationSucceeded {
            seq,
            result: translation("Tome su medicamento con alimentos."),
        });
        (session, seq)
    }

    #[test]
    fn translate_auto_chains_into_verification() {
        let mut session = WorkflowSession::new();
        let commands = session.apply(SessionEvent::TranslateRequested {
            source_text: "Hello".to_string(),
            target_language: "Spanish".to_string(),
        });
        assert!(matches!(commands[0], Command::Translate { .. }));
        assert_eq!(session.status(), Status::Translating);

        let commands = session.apply(SessionEvent::TranslationSucceeded {
            seq: session.seq(),
            result: translation("Hola"),
        });
        assert_eq!(session.status(), Status::Verifying);
        match &commands[0] {
            Command::Verify {
                translated_text, ..
            } => assert_eq!(translated_text, "Hola"),
            other => panic!("expected Verify, got {:?}", other),
        }
    }

    #[test]
    fn stale_translation_response_is_discarded() {
        let mut session = WorkflowSession::new();
        session.apply(SessionEvent::TranslateRequested {
            source_text: "first".to_string(),
            target_language: "Spanish".to_string(),
        });
        let stale_seq = session.seq();
        session.apply(SessionEvent::TranslateRequested {
            source_text: "second".to_string(),
            target_language: "Spanish".to_string(),
        });

        let commands = session.apply(SessionEvent::TranslationSucceeded {
            seq: stale_seq,
            result: translation("primero"),
        });
        assert!(commands.is_empty());
        assert!(session.translation().is_none());
        assert_eq!(session.status(), Status::Translating);

        session.apply(SessionEvent::TranslationSucceeded {
            seq: session.seq(),
            result: translation("segundo"),
        });
        assert_eq!(session.translation().unwrap().translation, "segundo");
    }

    #[test]
    fn verification_failure_keeps_the_translation() {
        let (mut session, seq) = session_with_translation();
        session.apply(SessionEvent::VerificationFailed {
            seq,
            text_version: session.text_version(),
            error: "upstream 500".to_string(),
        });
        assert_eq!(session.status(), Status::Failed(FailureKind::Verification));
        assert!(session.translation().is_some());
        assert_eq!(session.last_error(), Some("upstream 500"));
    }

    #[test]
    fn accepting_a_refinement_invalidates_verification_and_reverifies() {
        let (mut session, seq) = session_with_translation();
        session.apply(SessionEvent::VerificationSucceeded {
            seq,
            text_version: session.text_version(),
            result: verification(),
        });
        assert_eq!(session.status(), Status::VerificationReady);

        let commands = session.apply(SessionEvent::RefinementRequested {
            feedback: "make it more formal".to_string(),
        });
        assert!(matches!(commands[0], Command::Refine { .. }));
        session.apply(SessionEvent::RefinementSucceeded {
            seq,
            result: refinement("Por favor, tome su medicamento con alimentos."),
        });
        assert_eq!(session.status(), Status::RefinementReady);
        // Not auto-applied: the committed translation is unchanged so far.
        assert_eq!(
            session.translation().unwrap().translation,
            "Tome su medicamento con alimentos."
        );

        let commands = session.apply(SessionEvent::RefinementAccepted);
        assert!(session.verification().is_none());
        assert_eq!(
            session.translation().unwrap().translation,
            "Por favor, tome su medicamento con alimentos."
        );
        assert!(matches!(commands[0], Command::Verify { .. }));
    }

    #[test]
    fn discarding_a_refinement_returns_to_the_prior_state() {
        let (mut session, seq) = session_with_translation();
        session.apply(SessionEvent::VerificationSucceeded {
            seq,
            text_version: session.text_version(),
            result: verification(),
        });
        session.apply(SessionEvent::RefinementRequested {
            feedback: "shorter".to_string(),
        });
        session.apply(SessionEvent::RefinementSucceeded {
            seq,
            result: refinement("Tome con comida."),
        });
        session.apply(SessionEvent::RefinementDiscarded);
        assert_eq!(session.status(), Status::VerificationReady);
        assert!(session.refinement().is_none());
        assert!(session.verification().is_some());
    }

    #[test]
    fn manual_edit_invalidates_verification_and_reverifies() {
        let (mut session, seq) = session_with_translation();
        session.apply(SessionEvent::VerificationSucceeded {
            seq,
            text_version: session.text_version(),
            result: verification(),
        });
        let old_version = session.text_version();

        let commands = session.apply(SessionEvent::TranslationEdited {
            new_text: "Tome su medicina con comida.".to_string(),
        });
        assert!(session.verification().is_none());
        assert_eq!(session.status(), Status::Verifying);
        match &commands[0] {
            Command::Verify { text_version, .. } => assert_eq!(*text_version, old_version + 1),
            other => panic!("expected Verify, got {:?}", other),
        }
    }

    #[test]
    fn verification_for_an_edited_text_version_is_discarded() {
        let (mut session, seq) = session_with_translation();
        let pending_version = session.text_version();
        session.apply(SessionEvent::TranslationEdited {
            new_text: "Tome su medicina.".to_string(),
        });

        let commands = session.apply(SessionEvent::VerificationSucceeded {
            seq,
            text_version: pending_version,
            result: verification(),
        });
        assert!(commands.is_empty());
        assert!(session.verification().is_none());
    }

    #[test]
    fn audio_failure_restores_the_ready_state() {
        let (mut session, seq) = session_with_translation();
        session.apply(SessionEvent::VerificationSucceeded {
            seq,
            text_version: session.text_version(),
            result: verification(),
        });
        let commands = session.apply(SessionEvent::AudioRequested);
        assert!(matches!(commands[0], Command::SynthesizeAudio { .. }));
        assert_eq!(session.status(), Status::GeneratingAudio);

        session.apply(SessionEvent::AudioFailed {
            seq,
            error: "voice unavailable".to_string(),
        });
        assert_eq!(session.status(), Status::VerificationReady);
        assert!(session.translation().is_some());
        assert_eq!(session.last_error(), Some("voice unavailable"));
    }

    #[test]
    fn audio_success_holds_a_playable_resource() {
        let (mut session, seq) = session_with_translation();
        session.apply(SessionEvent::AudioRequested);
        session.apply(SessionEvent::AudioSucceeded {
            seq,
            audio_url: "data:audio/mpeg;base64,AAAA".to_string(),
        });
        assert_eq!(session.status(), Status::AudioReady);
        assert!(session.audio_url().unwrap().starts_with("data:audio/mpeg"));
    }

    #[test]
    fn restart_clears_everything_but_still_rejects_stale_responses() {
        let (mut session, seq) = session_with_translation();
        session.apply(SessionEvent::Restarted);
        assert_eq!(session.status(), Status::Idle);
        assert!(session.translation().is_none());

        let commands = session.apply(SessionEvent::TranslationSucceeded {
            seq,
            result: translation("tarde"),
        });
        assert!(commands.is_empty());
        assert!(session.translation().is_none());
    }

    #[test]
    fn empty_translate_input_is_rejected_without_a_request() {
        let mut session = WorkflowSession::new();
        let commands = session.apply(SessionEvent::TranslateRequested {
            source_text: "  ".to_string(),
            target_language: "Spanish".to_string(),
        });
        assert!(commands.is_empty());
        assert_eq!(session.status(), Status::Idle);
        assert!(session.last_error().is_some());
    }
}
