//! 按用户派生充值地址与签名密钥
//!
//! 单一主种子 + BIP44 路径 m/44'/60'/0'/0/{index}，同一 index 在任何进程、
//! 任何时刻派生结果一致。种子只在启动时从配置解析一次，仅驻留内存。

use bip39::{Language, Mnemonic};
use coins_bip32::path::DerivationPath;
use coins_bip32::prelude::*;
use k256::ecdsa::SigningKey;
use sha3::{Digest, Keccak256};
use zeroize::Zeroizing;

use crate::error::{Result, SettlementError};

/// HD 钱包派生器
///
/// `derive_address` 与 `with_signing_key` 都只读 `&self`，可跨任务并发调用
pub struct KeyDeriver {
    /// BIP39 种子（64 字节），Drop 时自动清零
    seed: Zeroizing<[u8; 64]>,
}

impl std::fmt::Debug for KeyDeriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDeriver")
            .field("seed", &"<redacted>")
            .finish()
    }
}

impl KeyDeriver {
    /// 解析助记词并生成种子；助记词非法属于配置错误，进程不应继续
    pub fn from_mnemonic(mnemonic: &str) -> Result<Self> {
        let mnemonic = Mnemonic::parse_in(Language::English, mnemonic.trim())
            .map_err(|e| SettlementError::Configuration(format!("invalid HD mnemonic: {e}")))?;
        let seed = Zeroizing::new(mnemonic.to_seed(""));
        Ok(Self { seed })
    }

    fn derive_xpriv(&self, index: u32) -> Result<XPriv> {
        let path = format!("m/44'/60'/0'/0/{index}")
            .parse::<DerivationPath>()
            .map_err(|e| SettlementError::Derivation(format!("invalid derivation path: {e}")))?;

        let master = XPriv::root_from_seed(self.seed.as_slice(), None)
            .map_err(|e| SettlementError::Derivation(format!("master key from seed: {e}")))?;

        master
            .derive_path(&path)
            .map_err(|e| SettlementError::Derivation(format!("derive index {index}: {e}")))
    }

    /// 派生第 index 个充值地址（0x 开头小写 hex）
    pub fn derive_address(&self, index: u32) -> Result<String> {
        let derived = self.derive_xpriv(index)?;
        let signing_key: &SigningKey = derived.as_ref();
        let address = ethereum_address(signing_key);
        // derived 离开作用域即销毁，密钥材料不外泄
        Ok(address)
    }

    /// 限定作用域地取用签名密钥
    ///
    /// 密钥只在闭包执行期间存在，闭包返回后（包括出错路径）随 XPriv
    /// 一起销毁，调用方拿不到密钥本体
    pub fn with_signing_key<T>(
        &self,
        index: u32,
        f: impl FnOnce(&SigningKey) -> Result<T>,
    ) -> Result<T> {
        let derived = self.derive_xpriv(index)?;
        let signing_key: &SigningKey = derived.as_ref();
        let out = f(signing_key);
        drop(derived);
        out
    }
}

/// 未压缩公钥去掉 0x04 前缀后做 Keccak256，取末 20 字节
fn ethereum_address(signing_key: &SigningKey) -> String {
    let verifying_key = signing_key.verifying_key();
    let encoded = verifying_key.to_encoded_point(false);
    let hash = Keccak256::digest(&encoded.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_derivation_is_deterministic() {
        let a = KeyDeriver::from_mnemonic(TEST_MNEMONIC).unwrap();
        let b = KeyDeriver::from_mnemonic(TEST_MNEMONIC).unwrap();

        for index in [0u32, 1, 7, 1000] {
            let addr1 = a.derive_address(index).unwrap();
            let addr2 = a.derive_address(index).unwrap();
            let addr3 = b.derive_address(index).unwrap();
            assert_eq!(addr1, addr2);
            assert_eq!(addr1, addr3);
            assert!(addr1.starts_with("0x"));
            assert_eq!(addr1.len(), 42);
        }
    }

    /// BIP39 标准测试向量：MetaMask 等主流钱包在 m/44'/60'/0'/0/0 的首地址
    #[test]
    fn test_bip39_reference_vector() {
        let deriver = KeyDeriver::from_mnemonic(TEST_MNEMONIC).unwrap();
        let address = deriver.derive_address(0).unwrap();
        assert_eq!(
            address.to_lowercase(),
            "0x9858effd232b4033e47d90003d23ec58e053e11f"
        );
    }

    #[test]
    fn test_distinct_indexes_yield_distinct_addresses() {
        let deriver = KeyDeriver::from_mnemonic(TEST_MNEMONIC).unwrap();
        let a = deriver.derive_address(0).unwrap();
        let b = deriver.derive_address(1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_mnemonic_is_configuration_error() {
        let err = KeyDeriver::from_mnemonic("not a real mnemonic phrase").unwrap_err();
        assert!(matches!(err, SettlementError::Configuration(_)));
    }

    #[test]
    fn test_signing_key_matches_address() {
        let deriver = KeyDeriver::from_mnemonic(TEST_MNEMONIC).unwrap();
        let address = deriver.derive_address(3).unwrap();
        let derived_addr = deriver
            .with_signing_key(3, |key| Ok(ethereum_address(key)))
            .unwrap();
        assert_eq!(address, derived_addr);
    }
}
