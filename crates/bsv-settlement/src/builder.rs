//! Input selection, fee convergence and signing.
//!
//! Everything here is pure: given the same candidates and policy the same
//! inputs, fee and change come out, which keeps sends reproducible.
//!
//! Candidates are taken smallest first until they cover the amount plus
//! the fee of a one-output transaction. The fee is then iterated: decide
//! whether the remainder is worth a change output, re-size the
//! transaction for that shape, and stop when the fee no longer moves. The
//! final split always satisfies `inputs == amount + fee + change`.

use std::collections::HashMap;

use bsv_primitives::ec::PrivateKey;
use bsv_script::{Address, Script};
use bsv_transaction::fee::estimate_fee;
use bsv_transaction::template::p2pkh;
use bsv_transaction::template::UnlockingScriptTemplate;
use bsv_transaction::{Transaction, TransactionOutput};

use crate::SettlementError;

/// An unspent output the merchant can spend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    /// The owned address holding it; selects the signing key.
    pub address: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeePolicy {
    pub sat_per_byte: u64,
    pub dust_limit: u64,
    pub max_iterations: usize,
}

/// One step of fee convergence for a fixed input set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeStep {
    pub fee: u64,
    pub with_change: bool,
}

/// Chosen inputs and how their value splits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<Candidate>,
    pub amount: u64,
    pub fee: u64,
    /// Zero when there is no change output.
    pub change: u64,
    pub iterations: usize,
}

impl Selection {
    pub fn total_in(&self) -> u64 {
        self.inputs.iter().map(|c| c.value).sum()
    }

    pub fn has_change(&self) -> bool {
        self.change > 0
    }
}

/// Smallest value first; ties broken by outpoint so order is total.
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.txid.cmp(&b.txid))
            .then_with(|| a.vout.cmp(&b.vout))
    });
}

/// Next fee estimate given the previous one.
pub fn fee_step(inputs: usize, total: u64, amount: u64, previous_fee: u64, policy: &FeePolicy) -> FeeStep {
    let with_change = amount
        .checked_add(previous_fee)
        .and_then(|spent| total.checked_sub(spent))
        .is_some_and(|remainder| remainder >= policy.dust_limit);
    let outputs = if with_change { 2 } else { 1 };
    FeeStep {
        fee: estimate_fee(inputs, outputs, policy.sat_per_byte),
        with_change,
    }
}

/// Pick inputs for `amount` and settle the fee.
///
/// `candidates` need not be sorted. Fails with `InsufficientFunds` when
/// even every candidate cannot pay the amount and a one-output fee.
pub fn select(candidates: &[Candidate], amount: u64, policy: &FeePolicy) -> Result<Selection, SettlementError> {
    let mut sorted = candidates.to_vec();
    sort_candidates(&mut sorted);

    let mut inputs = Vec::new();
    let mut total = 0u64;
    let mut covered = false;
    for candidate in sorted {
        total = total.saturating_add(candidate.value);
        inputs.push(candidate);
        let needed = amount.checked_add(estimate_fee(inputs.len(), 1, policy.sat_per_byte));
        if needed.is_some_and(|needed| total >= needed) {
            covered = true;
            break;
        }
    }
    if !covered {
        return Err(SettlementError::InsufficientFunds {
            available: total,
            required: amount.saturating_add(estimate_fee(inputs.len().max(1), 1, policy.sat_per_byte)),
        });
    }

    let n = inputs.len();
    let mut step = FeeStep {
        fee: estimate_fee(n, 1, policy.sat_per_byte),
        with_change: false,
    };
    let mut iterations = 0;
    while iterations < policy.max_iterations {
        iterations += 1;
        let next = fee_step(n, total, amount, step.fee, policy);
        let stable = next == step;
        step = next;
        if stable {
            break;
        }
    }

    // Settle on a shape the final fee actually allows.
    let remainder = amount.checked_add(step.fee).and_then(|spent| total.checked_sub(spent));
    let (fee, change) = match remainder {
        Some(change) if step.with_change && change >= policy.dust_limit => (step.fee, change),
        _ => {
            let one_output = estimate_fee(n, 1, policy.sat_per_byte);
            let required = amount.saturating_add(one_output);
            if total < required {
                return Err(SettlementError::InsufficientFunds {
                    available: total,
                    required,
                });
            }
            // Sub-dust remainder goes to the fee.
            (total - amount, 0)
        }
    };

    Ok(Selection {
        inputs,
        amount,
        fee,
        change,
        iterations,
    })
}

/// Assemble the transaction for `selection` and sign every input with the
/// key of the address that owns it.
pub fn build_and_sign(
    selection: &Selection,
    destination: &Address,
    change_to: &Address,
    keys: &HashMap<String, PrivateKey>,
) -> Result<Transaction, SettlementError> {
    let mut tx = Transaction::new();
    let mut signers = Vec::with_capacity(selection.inputs.len());
    for input in &selection.inputs {
        let key = keys
            .get(&input.address)
            .ok_or_else(|| SettlementError::Derivation(format!("no signing key for {}", input.address)))?;
        let locking_script: Script = Address::from_string(&input.address)?.locking_script();
        tx.add_input_from(&input.txid, input.vout, locking_script, input.value)
            .map_err(|e| SettlementError::MalformedData(format!("outpoint {}:{}: {}", input.txid, input.vout, e)))?;
        signers.push(p2pkh::unlock(key.clone(), None));
    }

    tx.add_output(TransactionOutput::new(selection.amount, destination.locking_script()));
    if selection.has_change() {
        tx.add_output(TransactionOutput::change(selection.change, change_to.locking_script()));
    }

    for (i, signer) in signers.iter().enumerate() {
        let unlocking = signer
            .sign(&tx, i)
            .map_err(|e| SettlementError::Derivation(format!("signing input {}: {}", i, e)))?;
        tx.inputs[i].unlocking_script = Some(unlocking);
    }
    Ok(tx)
}
