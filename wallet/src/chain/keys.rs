use bip39::Mnemonic;
use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use bitcoin::key::rand;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, CompressedPublicKey, Network};
use custody_session::{AddressDeriver, DerivedAddress, SeedGenerator, SessionError};
use std::collections::HashMap;
use std::str::FromStr;
use zeroize::Zeroizing;

/// BIP39 English phrases from 128 bits of entropy.
pub struct Bip39SeedGenerator;

impl SeedGenerator for Bip39SeedGenerator {
    fn generate(&self) -> Result<Zeroizing<String>, SessionError> {
        let entropy = Zeroizing::new(rand::random::<[u8; 16]>());
        let mnemonic = Mnemonic::from_entropy(&entropy[..])
            .map_err(|e| SessionError::Crypto(format!("Mnemonic generation failed: {}", e)))?;
        Ok(Zeroizing::new(mnemonic.to_string()))
    }

    fn validate(&self, phrase: &str) -> Result<(), SessionError> {
        Mnemonic::parse(phrase)
            .map(|_| ())
            .map_err(|e| SessionError::InvalidInput(format!("Invalid mnemonic: {}", e)))
    }
}

/// BIP44 coin type: 0 on mainnet, 1 on every test network.
pub fn coin_type(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

/// Native segwit receive path for an account.
pub fn receive_path(network: Network, account_index: u32) -> String {
    format!("m/84'/{}'/{}'/0/0", coin_type(network), account_index)
}

/// BIP84 derivation for every configured Bitcoin-family chain.
///
/// Each chain symbol maps to a network; the account index selects the
/// hardened account level and the first receive address is returned.
pub struct Bip84Deriver {
    networks: HashMap<String, Network>,
}

impl Bip84Deriver {
    pub fn new(networks: impl IntoIterator<Item = (String, Network)>) -> Self {
        Self {
            networks: networks.into_iter().collect(),
        }
    }
}

impl AddressDeriver for Bip84Deriver {
    fn derive(
        &self,
        seed: &str,
        chain_symbols: &[String],
        account_index: u32,
    ) -> Result<Vec<DerivedAddress>, SessionError> {
        let mnemonic = Mnemonic::parse(seed)
            .map_err(|e| SessionError::Derivation(format!("Invalid seed phrase: {}", e)))?;
        let seed_bytes = Zeroizing::new(mnemonic.to_seed(""));
        let secp = Secp256k1::new();

        chain_symbols
            .iter()
            .map(|symbol| {
                let network = *self.networks.get(symbol).ok_or_else(|| {
                    SessionError::Derivation(format!("No network configured for chain {}", symbol))
                })?;

                let master_key = Xpriv::new_master(network, &seed_bytes[..])
                    .map_err(|e| SessionError::Derivation(e.to_string()))?;

                let path = receive_path(network, account_index);
                let derivation_path = DerivationPath::from_str(&path)
                    .map_err(|e| SessionError::Derivation(format!("{}: {}", path, e)))?;

                let child = master_key
                    .derive_priv(&secp, &derivation_path)
                    .map_err(|e| SessionError::Derivation(e.to_string()))?;
                let xpub = Xpub::from_priv(&secp, &child);
                let address = Address::p2wpkh(&CompressedPublicKey(xpub.public_key), network);

                Ok(DerivedAddress {
                    chain_symbol: symbol.clone(),
                    address: address.to_string(),
                    path,
                })
            })
            .collect()
    }
}
