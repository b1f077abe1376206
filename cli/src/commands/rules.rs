use clap::{Args, Subcommand};

use plantwatch_engine::{Condition, RuleDraft, RuleId, Severity, TelemetryEngine};

use crate::error::{CliError, Result};
use crate::output::OutputManager;

#[derive(Args, Debug)]
pub struct RulesArgs {
    #[command(subcommand)]
    pub action: RulesAction,
}

#[derive(Subcommand, Debug)]
pub enum RulesAction {
    /// List threshold rules
    List {
        /// Only rules for this channel
        #[arg(short, long)]
        channel: Option<String>,
    },

    /// Show one rule
    Show {
        /// Rule id (e.g. rule-3 or 3)
        id: RuleId,
    },

    /// Add a threshold rule
    Add(RuleFields),

    /// Replace the fields of an existing rule, keeping its id
    Update {
        /// Rule id
        id: RuleId,

        #[command(flatten)]
        fields: RuleFields,
    },

    /// Remove a rule
    Remove {
        /// Rule id
        id: RuleId,
    },

    /// Enable a rule
    Enable {
        /// Rule id
        id: RuleId,
    },

    /// Disable a rule
    Disable {
        /// Rule id
        id: RuleId,
    },
}

#[derive(Args, Debug)]
pub struct RuleFields {
    /// Channel the rule watches
    #[arg(short, long)]
    pub channel: String,

    /// above, below or outside_range
    #[arg(long)]
    pub condition: Condition,

    /// Threshold (lower bound for outside_range)
    #[arg(long, allow_negative_numbers = true)]
    pub value: f64,

    /// Upper bound for outside_range
    #[arg(long, allow_negative_numbers = true)]
    pub max: Option<f64>,

    /// low, medium, high or critical
    #[arg(short, long, default_value = "medium")]
    pub severity: Severity,

    #[arg(short, long)]
    pub description: Option<String>,

    /// Create the rule disabled
    #[arg(long)]
    pub disabled: bool,
}

impl RuleFields {
    fn into_draft(self) -> RuleDraft {
        let mut draft = RuleDraft::new(self.channel, self.condition, self.value, self.severity);
        if let Some(max) = self.max {
            draft = draft.with_max(max);
        }
        if let Some(description) = self.description {
            draft = draft.with_description(description);
        }
        if self.disabled {
            draft = draft.disabled();
        }
        draft
    }
}

pub async fn run(args: RulesArgs, engine: TelemetryEngine, output: OutputManager) -> Result<()> {
    match args.action {
        RulesAction::List { channel } => {
            let rules = match channel {
                Some(channel) => engine.rules_for(&channel),
                None => engine.list_rules(),
            };
            output.print_rules(&rules)
        }
        RulesAction::Show { id } => {
            let rule = engine
                .get_rule(id)
                .ok_or_else(|| CliError::InvalidArgument(format!("Rule not found: {}", id)))?;
            output.print_rules(&[rule])
        }
        RulesAction::Add(fields) => {
            let id = engine.add_rule(fields.into_draft())?;
            output.print_success(&format!("Created {}", id))
        }
        RulesAction::Update { id, fields } => {
            let rule = engine.update_rule(id, fields.into_draft())?;
            output.print_success(&format!("Updated {}: {}", rule.id, rule.summary()))
        }
        RulesAction::Remove { id } => {
            let rule = engine.remove_rule(id)?;
            output.print_success(&format!("Removed {} ({})", rule.id, rule.summary()))
        }
        RulesAction::Enable { id } => {
            engine.set_rule_enabled(id, true)?;
            output.print_success(&format!("Enabled {}", id))
        }
        RulesAction::Disable { id } => {
            engine.set_rule_enabled(id, false)?;
            output.print_success(&format!("Disabled {}", id))
        }
    }
}
