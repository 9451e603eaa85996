//! Action Rendering boundary: the core never executes telephony actions
//! (answer, bridge, hangup, record, …) itself. Instead an action renders
//! to a list of `(application, data)` pairs a host switching engine runs.

use crate::error::{Result, SipError};

/// Everything an action needs to know about where it's rendering: inside
/// a dial plan (no live call yet) or against an established call.
#[derive(Debug, Clone, Default)]
pub struct RenderingContext {
    pub is_dialplan: bool,
    pub call_id: Option<String>,
    pub known_variables: std::collections::HashMap<String, String>,
}

impl RenderingContext {
    pub fn dialplan(known_variables: std::collections::HashMap<String, String>) -> Self {
        Self { is_dialplan: true, call_id: None, known_variables }
    }

    pub fn live_call(call_id: String, known_variables: std::collections::HashMap<String, String>) -> Self {
        Self { is_dialplan: false, call_id: Some(call_id), known_variables }
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.known_variables.get(name).map(String::as_str)
    }

    /// Actions that target a specific call go through this: it's the only
    /// place `CallIdRequired` is raised.
    pub fn require_call_id(&self) -> Result<&str> {
        if self.is_dialplan {
            return Err(SipError::Other("call_id required outside a dial plan context".to_string()));
        }
        self.call_id.as_deref().ok_or_else(|| SipError::Other("CallIdRequired".to_string()))
    }
}

/// One `(application, data)` pair a host switching engine executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteAction {
    pub application: String,
    pub data: String,
}

impl ExecuteAction {
    pub fn new(application: impl Into<String>, data: impl Into<String>) -> Self {
        Self { application: application.into(), data: data.into() }
    }
}

/// Something that renders to zero or more `ExecuteAction`s against a
/// given context. Implementors live outside this crate; this trait is
/// the contract they're held to.
pub trait Action: Send + Sync {
    fn render(&self, ctx: &RenderingContext, out: &mut Vec<ExecuteAction>) -> Result<()>;
}

/// Answers the current call. Requires a live call id.
pub struct Answer;

impl Action for Answer {
    fn render(&self, ctx: &RenderingContext, out: &mut Vec<ExecuteAction>) -> Result<()> {
        let call_id = ctx.require_call_id()?;
        out.push(ExecuteAction::new("answer", call_id));
        Ok(())
    }
}

/// Hangs up the current call with an optional cause code.
pub struct Hangup {
    pub cause: Option<String>,
}

impl Action for Hangup {
    fn render(&self, ctx: &RenderingContext, out: &mut Vec<ExecuteAction>) -> Result<()> {
        let call_id = ctx.require_call_id()?;
        let data = match &self.cause {
            Some(cause) => format!("{call_id} {cause}"),
            None => call_id.to_string(),
        };
        out.push(ExecuteAction::new("hangup", data));
        Ok(())
    }
}

/// Bridges the current call to a dial string. Valid from a dial plan (the
/// call being constructed) or a live call (transfer-style bridge).
pub struct Bridge {
    pub dial_string: String,
}

impl Action for Bridge {
    fn render(&self, ctx: &RenderingContext, out: &mut Vec<ExecuteAction>) -> Result<()> {
        if ctx.is_dialplan {
            out.push(ExecuteAction::new("bridge", self.dial_string.clone()));
        } else {
            let call_id = ctx.require_call_id()?;
            out.push(ExecuteAction::new("bridge", format!("{call_id} {}", self.dial_string)));
        }
        Ok(())
    }
}

/// Plays DTMF digits into the current call.
pub struct SendDtmf {
    pub digits: String,
}

impl Action for SendDtmf {
    fn render(&self, ctx: &RenderingContext, out: &mut Vec<ExecuteAction>) -> Result<()> {
        let call_id = ctx.require_call_id()?;
        out.push(ExecuteAction::new("send_dtmf", format!("{call_id} {}", self.digits)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_requires_call_id_outside_dialplan() {
        let ctx = RenderingContext::live_call("call-1".to_string(), Default::default());
        let mut out = Vec::new();
        Answer.render(&ctx, &mut out).unwrap();
        assert_eq!(out, vec![ExecuteAction::new("answer", "call-1")]);
    }

    #[test]
    fn answer_fails_without_call_id() {
        let ctx = RenderingContext::dialplan(Default::default());
        let mut out = Vec::new();
        let err = Answer.render(&ctx, &mut out).unwrap_err();
        assert!(matches!(err, SipError::Other(_)));
    }

    #[test]
    fn bridge_in_dialplan_does_not_need_call_id() {
        let ctx = RenderingContext::dialplan(Default::default());
        let mut out = Vec::new();
        Bridge { dial_string: "sofia/gateway/carrier/+14155551212".to_string() }.render(&ctx, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].application, "bridge");
    }

    #[test]
    fn hangup_appends_cause_when_present() {
        let ctx = RenderingContext::live_call("call-2".to_string(), Default::default());
        let mut out = Vec::new();
        Hangup { cause: Some("NORMAL_CLEARING".to_string()) }.render(&ctx, &mut out).unwrap();
        assert_eq!(out[0].data, "call-2 NORMAL_CLEARING");
    }
}
