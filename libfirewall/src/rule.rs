use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Nat,
    Mangle,
    Raw,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Mangle => "mangle",
            Table::Raw => "raw",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One iptables rule, identified by (IP version, table, chain, argument
/// vector). Two rules with the same identity are the same rule; the backend
/// treats duplicate inserts as no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub ipv: IpVersion,
    pub table: Table,
    pub chain: String,
    pub args: Vec<String>,
}

impl Rule {
    pub fn new<C, I, S>(ipv: IpVersion, table: Table, chain: C, args: I) -> Self
    where
        C: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Rule {
            ipv,
            table,
            chain: chain.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The argument vector as one space-joined string, the shape the
    /// iptables binary (and the tests) compare against.
    pub fn spec(&self) -> String {
        self.args.join(" ")
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} -A {} {}", self.table, self.chain, self.spec())
    }
}
