use async_trait::async_trait;
use docflow_workflow::{ClarificationQuestion, ContextDelta, GateContext, QaFinding, QaVerdict, TaskHandler};
use parking_lot::Mutex;

/// Task handler with fixed questions, verdicts and context delta
#[derive(Debug, Default)]
pub struct ScriptedHandler {
    questions: Vec<ClarificationQuestion>,
    always_veto: bool,
    delta: Option<ContextDelta>,
    evaluations: Mutex<Vec<u32>>,
}

impl ScriptedHandler {
    /// Asks nothing, passes everything
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn asking(questions: &[(&str, &str)]) -> Self {
        Self {
            questions: questions
                .iter()
                .map(|(id, text)| ClarificationQuestion::new(*id, *text))
                .collect(),
            ..Self::default()
        }
    }

    pub fn always_veto() -> Self {
        Self {
            always_veto: true,
            ..Self::default()
        }
    }

    pub fn with_delta(mut self, delta: ContextDelta) -> Self {
        self.delta = Some(delta);
        self
    }

    /// Attempt numbers seen by `evaluate`, in order
    pub fn evaluations(&self) -> Vec<u32> {
        self.evaluations.lock().clone()
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    async fn clarification_questions(&self, _ctx: &GateContext<'_>) -> Vec<ClarificationQuestion> {
        self.questions.clone()
    }

    async fn evaluate(&self, ctx: &GateContext<'_>, _output: &str) -> QaVerdict {
        self.evaluations.lock().push(ctx.attempt);
        if self.always_veto {
            QaVerdict::veto(vec![QaFinding::error(
                "incomplete",
                format!("attempt {} of {} is missing sections", ctx.attempt, ctx.doc_type),
            )])
        } else {
            QaVerdict::pass()
        }
    }

    fn context_delta(&self, _ctx: &GateContext<'_>, _output: &str) -> Option<ContextDelta> {
        self.delta.clone()
    }
}
