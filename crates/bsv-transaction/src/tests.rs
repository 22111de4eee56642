//! Transaction crate tests: wire round-trips of mainnet transactions,
//! txids, coinbase detection, FORKID preimages and P2PKH signing.

use bsv_primitives::ec::{PrivateKey, PublicKey, Signature};
use bsv_primitives::hash::sha256d;
use bsv_script::Script;

use crate::fee;
use crate::input::{TransactionInput, DEFAULT_SEQUENCE_NUMBER};
use crate::output::TransactionOutput;
use crate::sighash;
use crate::template::p2pkh;
use crate::template::UnlockingScriptTemplate;
use crate::transaction::Transaction;
use crate::TransactionError;

/// One P2PKH input, a 0x20-byte non-standard output and a P2PKH output.
const SOURCE_RAW_TX: &str = "010000000138c7c61c14ffb063c3bb2664041a3e29ea6ea0412a0c18ff725ba4e9e12afae2030000006a47304402203e9ab8e4c14addf3b4741540b556cfb0e0efb67dc1a7b5ce84c3ac56b3fd447802203c9f49f7bd893ebd7060176dfc36bcaff9d2c443d9a0dd6cd2d59b372c024d20412102798913bc057b344de675dac34faafe3dc2f312c758cd9068209f810877306d66ffffffff02dc050000000000002076a914eb0bd5edba389198e73f8efabddfc61666969ff788ac6a0568656c6c6faa0d0000000000001976a914eb0bd5edba389198e73f8efabddfc61666969ff788ac00000000";

const COINBASE_TX_HEX: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff17033f250d2f43555656452f2c903fb60859897700d02700ffffffff01d864a012000000001976a914d648686cf603c11850f39600e37312738accca8f88ac00000000";

/// Version 2, three inputs, lock time 103.
const MULTI_INPUT_TX_HEX: &str = "0200000003a9bc457fdc6a54d99300fb137b23714d860c350a9d19ff0f571e694a419ff3a0010000006b48304502210086c83beb2b2663e4709a583d261d75be538aedcafa7766bd983e5c8db2f8b2fc02201a88b178624ab0ad1748b37c875f885930166237c88f5af78ee4e61d337f935f412103e8be830d98bb3b007a0343ee5c36daa48796ae8bb57946b1e87378ad6e8a090dfeffffff0092bb9a47e27bf64fc98f557c530c04d9ac25e2f2a8b600e92a0b1ae7c89c20010000006b483045022100f06b3db1c0a11af348401f9cebe10ae2659d6e766a9dcd9e3a04690ba10a160f02203f7fbd7dfcfc70863aface1a306fcc91bbadf6bc884c21a55ef0d32bd6b088c8412103e8be830d98bb3b007a0343ee5c36daa48796ae8bb57946b1e87378ad6e8a090dfeffffff9d0d4554fa692420a0830ca614b6c60f1bf8eaaa21afca4aa8c99fb052d9f398000000006b483045022100d920f2290548e92a6235f8b2513b7f693a64a0d3fa699f81a034f4b4608ff82f0220767d7d98025aff3c7bd5f2a66aab6a824f5990392e6489aae1e1ae3472d8dffb412103e8be830d98bb3b007a0343ee5c36daa48796ae8bb57946b1e87378ad6e8a090dfeffffff02807c814a000000001976a9143a6bf34ebfcf30e8541bbb33a7882845e5a29cb488ac76b0e60e000000001976a914bd492b67f90cb85918494767ebb23102c4f06b7088ac67000000";

const FUNDING_TXID: &str = "11b476ad8e0a48fcd40807a111a050af51114877e09283bfa7f3505081a1819d";

fn key(byte: u8) -> PrivateKey {
    let mut bytes = [0u8; 32];
    bytes[31] = byte;
    PrivateKey::from_bytes(&bytes).expect("valid scalar")
}

/// A transaction spending one P2PKH output per key, paying 10,000 sats out.
fn unsigned_spend(keys: &[&PrivateKey]) -> Transaction {
    let mut tx = Transaction::new();
    for (vout, k) in keys.iter().enumerate() {
        let lock = Script::p2pkh(&k.pub_key().hash160());
        tx.add_input_from(FUNDING_TXID, vout as u32, lock, 50_000)
            .expect("valid txid");
    }
    tx.add_output(TransactionOutput::new(10_000, Script::p2pkh(&[0x11; 20])));
    tx
}

/// Split a P2PKH unlocking script into (DER signature, flag, pubkey).
fn split_unlocking(script: &Script) -> (Signature, u8, PublicKey) {
    let chunks = script.chunks().expect("decodable");
    assert_eq!(chunks.len(), 2);
    let sig = chunks[0].data.clone().expect("signature push");
    let pubkey = chunks[1].data.clone().expect("pubkey push");
    let (flag, der) = sig.split_last().expect("non-empty signature");
    (
        Signature::from_der(der).expect("DER"),
        *flag,
        PublicKey::from_bytes(&pubkey).expect("pubkey"),
    )
}

#[test]
fn test_from_hex_roundtrip() {
    let tx = Transaction::from_hex(SOURCE_RAW_TX).expect("should parse source tx hex");
    assert_eq!(tx.version, 1);
    assert_eq!(tx.inputs.len(), 1);
    assert_eq!(tx.outputs.len(), 2);
    assert_eq!(tx.lock_time, 0);
    assert_eq!(tx.outputs[0].satoshis, 1500);
    assert_eq!(tx.outputs[1].satoshis, 3498);
    assert!(tx.outputs[1].locking_script.is_p2pkh());
    assert!(!tx.outputs[0].locking_script.is_p2pkh());
    assert_eq!(tx.to_hex(), SOURCE_RAW_TX);
    assert_eq!(tx.to_string(), SOURCE_RAW_TX);
    assert_eq!(tx.size(), SOURCE_RAW_TX.len() / 2);
}

#[test]
fn test_multi_input_roundtrip() {
    let tx = Transaction::from_hex(MULTI_INPUT_TX_HEX).expect("should parse multi-input tx");
    assert_eq!(tx.version, 2);
    assert_eq!(tx.inputs.len(), 3);
    assert_eq!(tx.outputs.len(), 2);
    assert_eq!(tx.lock_time, 103);
    for input in &tx.inputs {
        assert_eq!(input.sequence_number, 0xFFFF_FFFE);
        assert!(input.unlocking_script.is_some());
    }
    assert_eq!(tx.to_hex(), MULTI_INPUT_TX_HEX);
}

#[test]
fn test_tx_ids() {
    let tx = Transaction::from_hex(SOURCE_RAW_TX).expect("parse");
    assert_eq!(tx.tx_id_hex(), FUNDING_TXID);
    assert_eq!(*tx.tx_id().as_bytes(), sha256d(&tx.to_bytes()));

    let multi = Transaction::from_hex(MULTI_INPUT_TX_HEX).expect("parse");
    assert_eq!(
        multi.tx_id_hex(),
        "bf5e05fdefc072a3113c69a6d6d0bc092e4e93b037d6785ccc795617132151e6"
    );
}

#[test]
fn test_source_txid_hex_is_display_order() {
    let tx = Transaction::from_hex(SOURCE_RAW_TX).expect("parse");
    assert_eq!(
        tx.inputs[0].source_txid_hex(),
        "e2fa2ae1e9a45b72ff180c2a41a06eea293e1a046426bbc363b0ff141cc6c738"
    );
    assert_eq!(tx.inputs[0].source_tx_out_index, 3);
}

#[test]
fn test_decode_errors() {
    let mut trailing = SOURCE_RAW_TX.to_string();
    trailing.push_str("00");
    assert!(matches!(
        Transaction::from_hex(&trailing),
        Err(TransactionError::SerializationError(_))
    ));
    assert!(Transaction::from_hex("zz").is_err());
    assert!(Transaction::from_bytes(&[]).is_err());
    assert!(Transaction::from_hex(&SOURCE_RAW_TX[..100]).is_err());
}

#[test]
fn test_coinbase_detection() {
    let coinbase = Transaction::from_hex(COINBASE_TX_HEX).expect("parse coinbase");
    assert!(coinbase.is_coinbase());
    assert_eq!(
        coinbase.tx_id_hex(),
        "f2feeafa708f31083549ab0b2487efc4cd007b239c5a099a9fc9de25feb0643a"
    );
    let regular = Transaction::from_hex(SOURCE_RAW_TX).expect("parse");
    assert!(!regular.is_coinbase());
}

#[test]
fn test_empty_transaction_is_ten_bytes() {
    let tx = Transaction::new();
    let bytes = tx.to_bytes();
    assert_eq!(bytes.len(), 10);
    assert_eq!(Transaction::from_bytes(&bytes).expect("roundtrip"), tx);
}

#[test]
fn test_add_input_from_records_source_output() {
    let k = key(1);
    let tx = unsigned_spend(&[&k]);
    let input = &tx.inputs[0];
    assert_eq!(input.sequence_number, DEFAULT_SEQUENCE_NUMBER);
    assert_eq!(input.source_txid_hex(), FUNDING_TXID);
    assert_eq!(input.source_output().map(|o| o.satoshis), Some(50_000));
    assert_eq!(tx.total_input_satoshis().expect("all inputs known"), 50_000);
    assert_eq!(tx.total_output_satoshis(), 10_000);

    let mut bare = Transaction::new();
    bare.add_input(TransactionInput::new([7u8; 32], 0));
    assert!(bare.total_input_satoshis().is_err());
}

#[test]
fn test_preimage_layout() {
    let k = key(1);
    let tx = unsigned_spend(&[&k]);
    let lock = Script::p2pkh(&k.pub_key().hash160());
    let preimage = sighash::calc_preimage(
        &tx,
        0,
        lock.to_bytes(),
        sighash::SIGHASH_ALL_FORKID,
        50_000,
    )
    .expect("preimage");

    // version + prevouts + sequences + outpoint + script + value + seq + outputs + locktime + type
    assert_eq!(preimage.len(), 4 + 32 + 32 + 36 + 1 + 25 + 8 + 4 + 32 + 4 + 4);
    assert_eq!(&preimage[..4], &1u32.to_le_bytes());
    assert_eq!(&preimage[preimage.len() - 4..], &0x41u32.to_le_bytes());
    assert_eq!(&preimage[105..130], lock.to_bytes());
    assert_eq!(&preimage[130..138], &50_000u64.to_le_bytes());
}

#[test]
fn test_sighash_rejects_other_types_and_indexes() {
    let k = key(1);
    let tx = unsigned_spend(&[&k]);
    assert!(sighash::signature_hash(&tx, 0, &[], sighash::SIGHASH_ALL, 1).is_err());
    assert!(matches!(
        sighash::signature_hash(&tx, 5, &[], sighash::SIGHASH_ALL_FORKID, 1),
        Err(TransactionError::InvalidTransaction(_))
    ));
}

#[test]
fn test_sighash_commits_to_value() {
    let k = key(1);
    let tx = unsigned_spend(&[&k]);
    let lock = Script::p2pkh(&k.pub_key().hash160());
    let a = sighash::signature_hash(&tx, 0, lock.to_bytes(), sighash::SIGHASH_ALL_FORKID, 50_000)
        .expect("sighash");
    let b = sighash::signature_hash(&tx, 0, lock.to_bytes(), sighash::SIGHASH_ALL_FORKID, 50_001)
        .expect("sighash");
    assert_ne!(a, b);
}

#[test]
fn test_p2pkh_signs_each_input_with_its_own_key() {
    let (k1, k2) = (key(1), key(2));
    let mut tx = unsigned_spend(&[&k1, &k2]);
    let templates = [p2pkh::unlock(k1.clone(), None), p2pkh::unlock(k2.clone(), None)];

    for (i, template) in templates.iter().enumerate() {
        let script = template.sign(&tx, i).expect("sign");
        assert!(script.len() <= template.estimate_length());
        tx.inputs[i].unlocking_script = Some(script);
    }

    for (i, k) in [&k1, &k2].iter().enumerate() {
        let unlocking = tx.inputs[i].unlocking_script.as_ref().expect("signed");
        let (sig, flag, pubkey) = split_unlocking(unlocking);
        assert_eq!(flag as u32, sighash::SIGHASH_ALL_FORKID);
        assert_eq!(pubkey, k.pub_key());
        assert!(sig.is_low_s());
        let digest = tx
            .calc_input_signature_hash(i, sighash::SIGHASH_ALL_FORKID)
            .expect("sighash");
        assert!(pubkey.verify(&digest, &sig), "input {} must verify", i);
    }

    // Unlocking scripts are not part of the digest, so re-signing is stable.
    let again = templates[0].sign(&tx, 0).expect("sign");
    assert_eq!(Some(&again), tx.inputs[0].unlocking_script.as_ref());

    let signed = Transaction::from_hex(&tx.to_hex()).expect("reparse");
    assert_eq!(signed.to_hex(), tx.to_hex());
    assert!(signed.size() <= fee::estimate_size(2, 1));
}

#[test]
fn test_p2pkh_rejects_foreign_input() {
    let (k1, k2) = (key(1), key(2));
    let tx = unsigned_spend(&[&k1]);
    let err = p2pkh::unlock(k2, None).sign(&tx, 0).expect_err("wrong key");
    assert!(matches!(err, TransactionError::SigningError(_)));
}

#[test]
fn test_p2pkh_requires_source_output() {
    let mut tx = Transaction::new();
    tx.add_input(TransactionInput::new([1u8; 32], 0));
    tx.add_output(TransactionOutput::new(1, Script::p2pkh(&[0u8; 20])));
    assert!(p2pkh::unlock(key(1), None).sign(&tx, 0).is_err());
    assert!(p2pkh::unlock(key(1), None).sign(&tx, 3).is_err());
}
