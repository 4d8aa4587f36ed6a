//! BEP20/ERC20 转账交易构造与签名
//!
//! 归集交易使用 legacy 格式 + EIP-155 重放保护（BSC 主网通用），
//! RLP 手工编码，签名走 k256 的确定性 ECDSA。

use anyhow::{Context, Result};
use ethers::types::U256;
use k256::ecdsa::SigningKey;
use rlp::RlpStream;
use sha3::{Digest, Keccak256};

/// transfer(address,uint256) 的函数选择器
const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// 待签交易参数
#[derive(Debug, Clone)]
pub struct TransferTx {
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    /// 代币合约地址
    pub to: String,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

/// 解析 0x 前缀的 20 字节地址
pub fn address_bytes(address: &str) -> Result<[u8; 20]> {
    let stripped = address
        .strip_prefix("0x")
        .with_context(|| format!("address missing 0x prefix: {address}"))?;
    let decoded = hex::decode(stripped).with_context(|| format!("invalid hex address: {address}"))?;
    let bytes: [u8; 20] = decoded
        .try_into()
        .map_err(|_| anyhow::anyhow!("address must be 20 bytes: {address}"))?;
    Ok(bytes)
}

/// 构造 transfer(recipient, amount) 的 calldata
pub fn erc20_transfer_data(recipient: &str, amount: U256) -> Result<Vec<u8>> {
    let recipient = address_bytes(recipient)?;

    let mut data = Vec::with_capacity(4 + 32 + 32);
    data.extend_from_slice(&TRANSFER_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(&recipient);

    let mut amount_buf = [0u8; 32];
    amount.to_big_endian(&mut amount_buf);
    data.extend_from_slice(&amount_buf);

    Ok(data)
}

/// RLP 整数编码要求最小字节表示
fn trim_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

fn encode_body(tx: &TransferTx, stream: &mut RlpStream, to: &[u8; 20]) {
    stream.append(&tx.nonce);
    stream.append(&tx.gas_price);
    stream.append(&tx.gas_limit);
    stream.append(&to.to_vec());
    // 代币转账本身不携带原生币
    stream.append(&0u64);
    stream.append(&tx.data);
}

/// 对交易做 EIP-155 签名，返回可直接广播的 raw transaction（0x hex）
pub fn sign_transfer(key: &SigningKey, tx: &TransferTx) -> Result<String> {
    let to = address_bytes(&tx.to)?;

    // 待签 payload：九元组，后三项为 (chain_id, 0, 0)
    let mut unsigned = RlpStream::new_list(9);
    encode_body(tx, &mut unsigned, &to);
    unsigned.append(&tx.chain_id);
    unsigned.append(&0u64);
    unsigned.append(&0u64);

    let digest = Keccak256::digest(unsigned.out());

    let (signature, recovery_id) = key
        .sign_prehash_recoverable(digest.as_slice())
        .context("ECDSA signing failed")?;

    let sig_bytes = signature.to_bytes();
    let sig = sig_bytes.as_slice();
    let r = trim_leading_zeros(&sig[..32]);
    let s = trim_leading_zeros(&sig[32..]);
    let v = tx.chain_id * 2 + 35 + u64::from(recovery_id.to_byte());

    let mut signed = RlpStream::new_list(9);
    encode_body(tx, &mut signed, &to);
    signed.append(&v);
    signed.append(&r);
    signed.append(&s);

    Ok(format!("0x{}", hex::encode(signed.out())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlp::Rlp;

    fn test_key() -> SigningKey {
        // 固定测试私钥，不对应任何真实资金
        let bytes =
            hex::decode("4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318")
                .unwrap();
        SigningKey::from_slice(&bytes).unwrap()
    }

    fn sample_tx() -> TransferTx {
        TransferTx {
            nonce: 9,
            gas_price: 5_000_000_000,
            gas_limit: 100_000,
            to: "0x55d398326f99059ff775485246999027b3197955".into(),
            data: erc20_transfer_data(
                "0x000000000000000000000000000000000000dead",
                U256::from(1_000_000_000_000_000_000u64),
            )
            .unwrap(),
            chain_id: 56,
        }
    }

    #[test]
    fn test_transfer_calldata_layout() {
        let data = erc20_transfer_data(
            "0x000000000000000000000000000000000000dead",
            U256::from(7u64),
        )
        .unwrap();
        assert_eq!(data.len(), 68);
        assert_eq!(&data[..4], &TRANSFER_SELECTOR);
        // 地址左补零到 32 字节
        assert_eq!(&data[4..16], &[0u8; 12]);
        assert_eq!(data[35], 0xad);
        // 金额大端右对齐
        assert_eq!(data[67], 7);
    }

    #[test]
    fn test_signing_is_deterministic() {
        let key = test_key();
        let tx = sample_tx();
        let a = sign_transfer(&key, &tx).unwrap();
        let b = sign_transfer(&key, &tx).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("0x"));
    }

    #[test]
    fn test_signed_tx_is_valid_rlp_with_eip155_v() {
        let key = test_key();
        let tx = sample_tx();
        let raw = sign_transfer(&key, &tx).unwrap();
        let bytes = hex::decode(raw.trim_start_matches("0x")).unwrap();

        let decoded = Rlp::new(&bytes);
        assert!(decoded.is_list());
        assert_eq!(decoded.item_count().unwrap(), 9);

        let nonce: u64 = decoded.val_at(0).unwrap();
        assert_eq!(nonce, 9);

        let v: u64 = decoded.val_at(6).unwrap();
        // chain_id=56 时 v 必须是 147 或 148
        assert!(v == 56 * 2 + 35 || v == 56 * 2 + 36);

        let r: Vec<u8> = decoded.val_at(7).unwrap();
        let s: Vec<u8> = decoded.val_at(8).unwrap();
        assert!(!r.is_empty() && r.len() <= 32);
        assert!(!s.is_empty() && s.len() <= 32);
        // 最小整数编码不允许前导零
        assert_ne!(r[0], 0);
        assert_ne!(s[0], 0);
    }

    #[test]
    fn test_bad_address_rejected() {
        assert!(address_bytes("55d398326f99059ff775485246999027b3197955").is_err());
        assert!(address_bytes("0x1234").is_err());
        assert!(erc20_transfer_data("0xzz", U256::one()).is_err());
    }
}
