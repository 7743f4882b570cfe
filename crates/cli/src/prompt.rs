use dialoguer::Confirm;
use engine::scenario::{NonInteractive, WorkflowHooks};
use std::io::IsTerminal;

/// Asks the operator on the terminal at every `pause` step. Falls back to
/// continuing immediately when stdin is not a terminal or prompting is off.
pub struct TerminalHooks {
    interactive: bool,
}

impl TerminalHooks {
    pub fn new(interactive: bool) -> Self {
        Self {
            interactive: interactive && std::io::stdin().is_terminal(),
        }
    }
}

impl WorkflowHooks for TerminalHooks {
    fn pause(&self, message: &str) -> bool {
        if !self.interactive {
            return NonInteractive.pause(message);
        }
        match Confirm::new()
            .with_prompt(format!("{} - continue?", message))
            .default(true)
            .interact()
        {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(error = %e, "prompt failed, aborting run");
                false
            }
        }
    }
}
