use crate::config::ConfigFile;
use crate::firewall::Firewall;
use crate::options::fields_from_option_args;
use crate::rule::{Action, Direction, Rule};
use crate::sim::SimDataplane;
use crate::stats;
use anyhow::anyhow;
use clap::Subcommand;
use log::info;

/// Operations on the rules of one chain.
#[derive(Debug, Subcommand)]
pub enum RuleOp {
    /// Adds a rule after the last one
    Append {
        #[clap(short, long)]
        action: Option<Action>,

        #[clap(long, default_value = "")]
        description: String,

        /// Match fields as key=value pairs, e.g. `src=10.0.0.0/8 dport=22`
        fields: Vec<String>,
    },

    /// Places a rule at `id`, an existing rule there is overwritten
    Insert {
        id: u32,

        #[clap(short, long, default_value_t = Action::Drop)]
        action: Action,

        #[clap(long, default_value = "")]
        description: String,

        fields: Vec<String>,
    },

    /// Changes the existing rule `id`
    Replace {
        id: u32,

        #[clap(short, long, default_value_t = Action::Drop)]
        action: Action,

        #[clap(long, default_value = "")]
        description: String,

        fields: Vec<String>,
    },

    /// Removes rule `id`, the following rules move down one position
    Remove { id: u32 },

    /// Removes all the rules of the chain
    Clear,

    /// Sets the action taken when no rule matches
    Default { action: Action },

    /// Shows rule `id` or the whole chain
    Show { id: Option<u32> },
}

impl RuleOp {
    /// Runs the operation on the `direction` chain, returns false if nothing
    /// was changed.
    pub fn apply(&self, fw: &Firewall, direction: Direction) -> Result<bool, anyhow::Error> {
        match self {
            RuleOp::Append {
                action,
                description,
                fields,
            } => {
                let id = fw.append(
                    direction,
                    fields_from_option_args(fields)?,
                    *action,
                    description,
                )?;
                info!("[{}] Rule {} appended", direction, id);
            }
            RuleOp::Insert {
                id,
                action,
                description,
                fields,
            } => {
                let rule = Rule::new(*id, fields_from_option_args(fields)?, *action)
                    .with_description(description);
                fw.insert(direction, rule)?;
                info!("[{}] Rule {} inserted", direction, id);
            }
            RuleOp::Replace {
                id,
                action,
                description,
                fields,
            } => {
                fw.replace(
                    direction,
                    *id,
                    fields_from_option_args(fields)?,
                    *action,
                    description,
                )?;
                info!("[{}] Rule {} replaced", direction, id);
            }
            RuleOp::Remove { id } => {
                fw.remove(direction, *id)?;
                info!("[{}] Rule {} removed", direction, id);
            }
            RuleOp::Clear => {
                fw.clear(direction)?;
                info!("[{}] All rules removed", direction);
            }
            RuleOp::Default { action } => {
                fw.set_default_action(direction, *action)?;
                info!("[{}] Default action set to {}", direction, action);
            }
            RuleOp::Show { id: Some(id) } => {
                let rule = fw.rule(direction, *id)?;
                let counter = fw.counters(direction, *id)?;
                let mut table = stats::rule_table();
                table.push_row(stats::rule_row(rule, counter));
                table.print(&format!("{} rule {}", direction, id));
                return Ok(false);
            }
            RuleOp::Show { id: None } => {
                stats::counters_table(fw, direction)?.print(&format!("{} chain", direction));
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Loads the rules of a config file, runs `op` in batch mode and saves the
/// compiled result back to the same file.
pub fn edit(config: &str, direction: Direction, op: &RuleOp) -> Result<(), anyhow::Error> {
    let fw = Firewall::new("rules", Box::new(SimDataplane::new()), true)?;
    let file = ConfigFile::new(&config);
    file.load(&fw)?;

    let interactive = fw.is_interactive();
    fw.set_interactive(false);
    let changed = op.apply(&fw, direction);
    fw.set_interactive(interactive);

    if !changed? {
        return Ok(());
    }
    if !fw.apply_all() {
        return Err(anyhow!("Failed to compile the {} chain", direction));
    }
    file.save(&fw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::fs;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn temp_config(name: &str, contents: &str) -> String {
        let path = std::env::temp_dir().join(format!("zfw-rules-{}-{}.toml", name, std::process::id()));
        fs::write(&path, contents).unwrap();
        path.to_string_lossy().to_string()
    }

    const CONFIG: &str = r#"
interactive = true
[ingress]
default = "drop"
[[ingress.rule]]
src = "10.0.0.1"
action = "forward"
description = "admin"
[[ingress.rule]]
dport = 22
action = "log"
[[ingress.rule]]
src = "10.0.0.0/8"
action = "forward"
"#;

    #[test]
    fn crud_on_firewall() {
        let fw = Firewall::new("fw0", Box::new(SimDataplane::new()), true).unwrap();
        let dir = Direction::Ingress;
        let append = RuleOp::Append {
            action: Some(Action::Forward),
            description: "web".to_string(),
            fields: args(&["dport=80"]),
        };
        assert!(append.apply(&fw, dir).unwrap());
        assert!(append.apply(&fw, dir).unwrap());

        let replace = RuleOp::Replace {
            id: 1,
            action: Action::Log,
            description: String::new(),
            fields: args(&["dport=443"]),
        };
        assert!(replace.apply(&fw, dir).unwrap());
        assert_eq!(fw.rule(dir, 1).unwrap().fields.dport, Some(443));

        assert!(RuleOp::Remove { id: 0 }.apply(&fw, dir).unwrap());
        assert_eq!(fw.rule(dir, 0).unwrap().action, Action::Log);
        assert!(!RuleOp::Show { id: Some(0) }.apply(&fw, dir).unwrap());
        assert!(!RuleOp::Show { id: None }.apply(&fw, dir).unwrap());

        let err = RuleOp::Remove { id: 5 }.apply(&fw, dir).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(5))));
        let err = RuleOp::Show { id: Some(3) }.apply(&fw, dir).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(3))));

        assert!(RuleOp::Default {
            action: Action::Forward
        }
        .apply(&fw, dir)
        .unwrap());
        assert_eq!(fw.default_action(dir).unwrap(), Action::Forward);

        assert!(RuleOp::Clear.apply(&fw, dir).unwrap());
        assert_eq!(fw.rules(dir).unwrap().len(), 1);
    }

    #[test]
    fn edit_saves_the_config() {
        let path = temp_config("edit", CONFIG);

        edit(&path, Direction::Ingress, &RuleOp::Remove { id: 0 }).unwrap();
        let op = RuleOp::Insert {
            id: 5,
            action: Action::Drop,
            description: "scanner".to_string(),
            fields: args(&["src=192.168.1.7"]),
        };
        edit(&path, Direction::Ingress, &op).unwrap();
        edit(&path, Direction::Egress, &RuleOp::Default { action: Action::Log }).unwrap();

        let fw = Firewall::new("fw1", Box::new(SimDataplane::new()), true).unwrap();
        ConfigFile::new(&path).load(&fw).unwrap();
        assert!(fw.is_interactive());
        let rules = fw.rules(Direction::Ingress).unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0].fields.dport, Some(22));
        assert_eq!(rules[1].id, 1);
        assert_eq!(rules[2].id, 5);
        assert_eq!(rules[2].description, "scanner");
        assert_eq!(fw.default_action(Direction::Egress).unwrap(), Action::Log);

        assert!(edit(&path, Direction::Ingress, &RuleOp::Remove { id: 3 }).is_err());
        let fw = Firewall::new("fw2", Box::new(SimDataplane::new()), true).unwrap();
        ConfigFile::new(&path).load(&fw).unwrap();
        assert_eq!(fw.rules(Direction::Ingress).unwrap().len(), 4);

        fs::remove_file(&path).unwrap();
    }
}
