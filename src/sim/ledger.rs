use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use sylvia::cw_std::Uint256;

/// Token balances and allowances of one simulated chain.
#[derive(Clone, Debug, Default)]
pub struct Ledger<A: Eq + Hash> {
    balances: HashMap<(A, A), Uint256>,
    allowances: HashMap<(A, A, A), Uint256>,
}

impl<A: Copy + Eq + Hash + Display> Ledger<A> {
    pub fn new() -> Self {
        Self {
            balances: HashMap::new(),
            allowances: HashMap::new(),
        }
    }

    pub fn balance(&self, token: &A, owner: &A) -> Uint256 {
        self.balances
            .get(&(*token, *owner))
            .copied()
            .unwrap_or_default()
    }

    pub fn allowance(&self, token: &A, owner: &A, spender: &A) -> Uint256 {
        self.allowances
            .get(&(*token, *owner, *spender))
            .copied()
            .unwrap_or_default()
    }

    pub fn mint(&mut self, token: &A, owner: &A, amount: Uint256) {
        let balance = self.balances.entry((*token, *owner)).or_default();
        *balance = balance.saturating_add(amount);
    }

    pub fn approve(&mut self, token: &A, owner: &A, spender: &A, amount: Uint256) {
        self.allowances.insert((*token, *owner, *spender), amount);
    }

    pub fn transfer(&mut self, token: &A, from: &A, to: &A, amount: Uint256) -> Result<(), String> {
        let have = self.balance(token, from);
        let rest = have
            .checked_sub(amount)
            .map_err(|_| format!("{from} holds {have} of {token}, needs {amount}"))?;
        self.balances.insert((*token, *from), rest);
        self.mint(token, to, amount);
        Ok(())
    }

    /// Spends `spender`'s allowance. An unlimited allowance is not consumed.
    pub fn transfer_from(
        &mut self,
        token: &A,
        spender: &A,
        from: &A,
        to: &A,
        amount: Uint256,
    ) -> Result<(), String> {
        let allowed = self.allowance(token, from, spender);
        if allowed != Uint256::MAX {
            let rest = allowed
                .checked_sub(amount)
                .map_err(|_| format!("{spender} may spend {allowed} of {token} from {from}, needs {amount}"))?;
            self.approve(token, from, spender, rest);
        }
        self.transfer(token, from, to, amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::EvmAddress;

    #[test]
    fn transfer_from_consumes_allowance() {
        let token = EvmAddress([1; 20]);
        let (alice, bob, spender) = (EvmAddress([2; 20]), EvmAddress([3; 20]), EvmAddress([4; 20]));
        let mut ledger = Ledger::new();
        ledger.mint(&token, &alice, Uint256::from(10u128));
        ledger.approve(&token, &alice, &spender, Uint256::from(6u128));

        ledger
            .transfer_from(&token, &spender, &alice, &bob, Uint256::from(4u128))
            .unwrap();
        assert_eq!(ledger.balance(&token, &bob), Uint256::from(4u128));
        assert_eq!(ledger.allowance(&token, &alice, &spender), Uint256::from(2u128));
        assert!(ledger
            .transfer_from(&token, &spender, &alice, &bob, Uint256::from(4u128))
            .is_err());
        assert!(ledger
            .transfer(&token, &bob, &alice, Uint256::from(5u128))
            .is_err());
    }
}
