use crate::error::Error;
use crate::firewall::Firewall;
use crate::protocols::{l4proto_name, parse_l4proto};
use crate::rule::{Action, ConntrackState, Direction, FlagMatch, IpPrefix, MatchFields, Rule};
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::{
    fs::OpenOptions,
    io::{Read, Write},
    path::Path,
};

#[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
struct RuleEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conntrack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    l4proto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sport: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dport: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tcpflags: Option<String>,
    #[serde(default)]
    action: Action,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
}

impl RuleEntry {
    fn fields(&self) -> Result<MatchFields, Error> {
        Ok(MatchFields {
            conntrack: self
                .conntrack
                .as_deref()
                .map(str::parse::<ConntrackState>)
                .transpose()?,
            src: self.src.as_deref().map(str::parse::<IpPrefix>).transpose()?,
            dst: self.dst.as_deref().map(str::parse::<IpPrefix>).transpose()?,
            l4proto: self.l4proto.as_deref().map(parse_l4proto).transpose()?,
            sport: self.sport,
            dport: self.dport,
            tcpflags: self
                .tcpflags
                .as_deref()
                .map(str::parse::<FlagMatch>)
                .transpose()?,
        })
    }
}

impl From<&Rule> for RuleEntry {
    fn from(rule: &Rule) -> Self {
        let f = &rule.fields;
        Self {
            id: Some(rule.id),
            conntrack: f.conntrack.map(|c| c.to_string()),
            src: f.src.map(|p| p.to_string()),
            dst: f.dst.map(|p| p.to_string()),
            l4proto: f.l4proto.map(l4proto_name),
            sport: f.sport,
            dport: f.dport,
            tcpflags: f.tcpflags.map(|fm| fm.to_string()),
            action: rule.action,
            description: rule.description.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
struct ChainEntry {
    #[serde(default)]
    default: Action,
    #[serde(default, rename = "rule", skip_serializing_if = "Vec::is_empty")]
    rules: Vec<RuleEntry>,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    interactive: bool,
    #[serde(default)]
    conntrack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ingress: Option<ChainEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    egress: Option<ChainEntry>,
}

impl Config {
    pub fn parse(contents: &str) -> Result<Self, anyhow::Error> {
        Ok(toml::from_str(contents)?)
    }

    fn chain(&self, direction: Direction) -> Option<&ChainEntry> {
        match direction {
            Direction::Ingress => self.ingress.as_ref(),
            Direction::Egress => self.egress.as_ref(),
        }
    }

    pub fn description(&self) -> String {
        let count = |c: &Option<ChainEntry>| c.as_ref().map_or(0, |c| c.rules.len());
        format!(
            "{} ingress and {} egress rules, {} mode",
            count(&self.ingress),
            count(&self.egress),
            if self.interactive { "interactive" } else { "batch" }
        )
    }

    /// Replaces the rules of the firewall with the configured ones and
    /// compiles both chains once.
    pub fn apply(&self, fw: &Firewall) -> Result<(), anyhow::Error> {
        fw.set_interactive(false);
        fw.set_conntrack_active(self.conntrack);

        for direction in Direction::ALL {
            fw.clear(direction)?;
            let chain = match self.chain(direction) {
                Some(chain) => chain,
                None => continue,
            };
            fw.set_default_action(direction, chain.default)?;
            for (idx, entry) in chain.rules.iter().enumerate() {
                let fields = entry
                    .fields()
                    .context(format!("{} rule #{}", direction, idx))?;
                match entry.id {
                    Some(id) => fw.insert(
                        direction,
                        Rule::new(id, fields, entry.action).with_description(&entry.description),
                    )?,
                    None => {
                        fw.append(direction, fields, Some(entry.action), &entry.description)?;
                    }
                }
            }
        }

        if !fw.apply_all() {
            return Err(anyhow!("Failed to compile the chains of {}", fw.name()));
        }
        fw.set_interactive(self.interactive);
        Ok(())
    }

    /// Current state of the firewall.
    pub fn fetch(fw: &Firewall) -> Result<Self, anyhow::Error> {
        let mut cfg = Config {
            interactive: fw.is_interactive(),
            conntrack: fw.is_conntrack_active(),
            ..Default::default()
        };
        for direction in Direction::ALL {
            let mut rules = fw.rules(direction)?;
            // Default policy
            rules.pop();
            let chain = ChainEntry {
                default: fw.default_action(direction)?,
                rules: rules.iter().map(RuleEntry::from).collect(),
            };
            match direction {
                Direction::Ingress => cfg.ingress = Some(chain),
                Direction::Egress => cfg.egress = Some(chain),
            }
        }
        Ok(cfg)
    }
}

pub struct ConfigFile {
    path: String,
}

impl ConfigFile {
    pub fn new<S: AsRef<str>>(filename: &S) -> Self {
        Self {
            path: String::from(filename.as_ref()),
        }
    }

    pub fn read(&self) -> Result<Config, anyhow::Error> {
        if !Path::new(&self.path).try_exists()? {
            return Err(anyhow!("Config file does not exist, {}", self.path));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .context(format!("Can't read config file: {}", self.path))?;
        let mut contents = String::new();
        let size = file.read_to_string(&mut contents)?;

        log::info!("Read {} bytes from: {}", size, self.path);

        let cfg = Config::parse(&contents).context(format!("Invalid config {}", self.path))?;

        log::info!("Found in config: {}", cfg.description());
        Ok(cfg)
    }

    pub fn load(&self, fw: &Firewall) -> Result<(), anyhow::Error> {
        self.read()?.apply(fw)
    }

    pub fn save(&self, fw: &Firewall) -> Result<(), anyhow::Error> {
        if Path::new(&self.path).try_exists()? {
            log::info!("Config file will be overridden, {}", self.path);
        }
        let cfg = Config::fetch(fw)?;

        log::info!("Saving config: {}", cfg.description());

        let contents = toml::to_string(&cfg)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .context(format!("Can't write to config file: {}", self.path))?;
        file.write_all(contents.as_bytes())?;

        log::info!(
            "Wrote {} bytes to config file: {}",
            contents.len(),
            self.path
        );

        Ok(())
    }
}
