use crate::firewall::Firewall;
use crate::module::ModuleKind;
use crate::rule::Direction;
use zon_fw_common::{DEFAULT_ACTION_POSITION, FORWARDER_POSITION, PARSER_POSITION};

/// Column aligned table printed to stdout.
pub struct InfoTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl InfoTable {
    pub fn new(header: Vec<&str>) -> Self {
        Self {
            header: header.iter().map(|s| s.to_string()).collect(),
            rows: vec![],
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    fn sizes(&self) -> Vec<usize> {
        let mut sizes = self.header.iter().map(|s| s.len()).collect::<Vec<_>>();
        for row in &self.rows {
            for (i, s) in row.iter().enumerate().take(sizes.len()) {
                sizes[i] = sizes[i].max(s.len());
            }
        }
        sizes
    }

    fn line(sizes: &[usize], row: &[String]) -> String {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| format!("{0:<1$}", row.get(i).map_or("", |s| s.as_str()), size + 1))
            .collect::<String>()
            .trim_end()
            .to_string()
    }

    pub fn render(&self, title: &str) -> String {
        let sizes = self.sizes();
        let header = Self::line(&sizes, &self.header);
        let width = sizes.iter().map(|s| s + 1).sum::<usize>().max(title.len());
        let mut out = vec![];
        if !title.is_empty() {
            out.push(title.to_string());
        }
        out.push(header);
        out.push(format!("{0:-<1$}", "", width));
        for row in &self.rows {
            out.push(Self::line(&sizes, row));
        }
        out.join("\n")
    }

    pub fn print(&self, title: &str) {
        println!("{}\n", self.render(title));
    }
}

/// Prints the modules serving each chain ordered by position.
pub fn print_layout(fw: &Firewall) -> Result<(), anyhow::Error> {
    let mut table = InfoTable::new(vec!["position", "module", "chain"]);
    for (position, kind) in [
        (PARSER_POSITION, ModuleKind::Parser),
        (FORWARDER_POSITION, ModuleKind::Forwarder),
        (DEFAULT_ACTION_POSITION, ModuleKind::DefaultAction),
    ] {
        table.push_row(vec![position.to_string(), kind.to_string(), "*".to_string()]);
    }
    for direction in Direction::ALL {
        for (kind, position) in fw.layout(direction)? {
            table.push_row(vec![
                position.to_string(),
                kind.to_string(),
                direction.to_string(),
            ]);
        }
    }
    table.print(&format!("[{}] pipeline, {} modules", fw.name(), fw.nr_modules()?));

    for direction in Direction::ALL {
        let pending = if fw.is_dirty(direction)? {
            ", changes not applied"
        } else {
            ""
        };
        match fw.generation(direction)? {
            Some(generation) => println!(
                "{}: entry {}, {} rules, slot {}, installed at {}{}",
                direction,
                generation.entry,
                generation.rules,
                generation.slot,
                generation.installed_at.format("%H:%M:%S %d-%m-%Y"),
                pending
            ),
            None => println!("{}: not compiled, default action only{}", direction, pending),
        }
    }
    println!();
    Ok(())
}
