//! Per-network chain parameters.

/// Networks the node can run on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Main,
    Test,
    Regtest,
}

/// Parameters that vary by network.
///
/// `sc_coins_maturity` is the number of blocks after which sidechain
/// transfers mature into the sidechain balance. Regtest may override it for
/// test scenarios; the other networks use the fixed consensus value.
#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub sc_coins_maturity: u32,
}

/// Sidechain transfer maturity on main and test networks.
pub const SC_COINS_MATURITY: u32 = 2;

impl ChainParams {
    pub fn main() -> Self {
        Self {
            network: Network::Main,
            sc_coins_maturity: SC_COINS_MATURITY,
        }
    }

    pub fn test() -> Self {
        Self {
            network: Network::Test,
            sc_coins_maturity: SC_COINS_MATURITY,
        }
    }

    pub fn regtest(sc_coins_maturity_override: Option<u32>) -> Self {
        Self {
            network: Network::Regtest,
            sc_coins_maturity: sc_coins_maturity_override.unwrap_or(SC_COINS_MATURITY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regtest_maturity_override() {
        assert_eq!(ChainParams::main().sc_coins_maturity, SC_COINS_MATURITY);
        assert_eq!(ChainParams::regtest(None).sc_coins_maturity, SC_COINS_MATURITY);
        assert_eq!(ChainParams::regtest(Some(4)).sc_coins_maturity, 4);
    }
}
