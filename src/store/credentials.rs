use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, params};

use crate::broker::BrokerAuth;
use crate::model::AccountKey;
use crate::model::settings::CredentialType;
use crate::vault::{Sealed, Vault, VaultError};

/// One account's encrypted broker credentials as stored at rest. The api key
/// and api secret are sealed independently; their ivs and tags share the two
/// legacy columns joined as `keyhex:secrethex`.
#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub account: AccountKey,
    pub api_key: Sealed,
    pub api_secret: Sealed,
    pub base_url: String,
}

impl CredentialRow {
    pub fn decrypt(&self, vault: &Vault) -> Result<BrokerAuth, VaultError> {
        Ok(BrokerAuth {
            api_key: vault.decrypt_sealed(&self.api_key)?,
            api_secret: vault.decrypt_sealed(&self.api_secret)?,
            base_url: self.base_url.clone(),
        })
    }
}

pub fn get(conn: &Connection, account: &AccountKey) -> Result<Option<CredentialRow>> {
    let row = conn
        .query_row(
            "SELECT encrypted_api_key, encrypted_api_secret, iv, auth_tag, base_url
             FROM broker_credentials WHERE user_id = ?1 AND credential_type = ?2",
            params![account.user_id, account.credential_type.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .context("loading broker credentials")?;

    let Some((key_ct, secret_ct, ivs, tags, base_url)) = row else {
        return Ok(None);
    };

    let (key_iv, secret_iv) = split_pair(&ivs).context("parsing iv column")?;
    let (key_tag, secret_tag) = split_pair(&tags).context("parsing auth_tag column")?;

    Ok(Some(CredentialRow {
        account: account.clone(),
        api_key: Sealed {
            ciphertext: hex::decode(&key_ct).context("decoding encrypted_api_key")?,
            iv: key_iv.try_into().map_err(|_| bad_len("iv"))?,
            tag: key_tag.try_into().map_err(|_| bad_len("auth_tag"))?,
        },
        api_secret: Sealed {
            ciphertext: hex::decode(&secret_ct).context("decoding encrypted_api_secret")?,
            iv: secret_iv.try_into().map_err(|_| bad_len("iv"))?,
            tag: secret_tag.try_into().map_err(|_| bad_len("auth_tag"))?,
        },
        base_url,
    }))
}

pub fn put(conn: &Connection, row: &CredentialRow) -> Result<()> {
    conn.execute(
        "INSERT INTO broker_credentials
             (user_id, credential_type, encrypted_api_key, encrypted_api_secret, iv, auth_tag, base_url)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (user_id, credential_type) DO UPDATE SET
             encrypted_api_key = excluded.encrypted_api_key,
             encrypted_api_secret = excluded.encrypted_api_secret,
             iv = excluded.iv,
             auth_tag = excluded.auth_tag,
             base_url = excluded.base_url",
        params![
            row.account.user_id,
            row.account.credential_type.as_str(),
            hex::encode(&row.api_key.ciphertext),
            hex::encode(&row.api_secret.ciphertext),
            format!("{}:{}", hex::encode(row.api_key.iv), hex::encode(row.api_secret.iv)),
            format!("{}:{}", hex::encode(row.api_key.tag), hex::encode(row.api_secret.tag)),
            row.base_url,
        ],
    )
    .context("storing broker credentials")?;
    Ok(())
}

pub fn exists(conn: &Connection, account: &AccountKey) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM broker_credentials WHERE user_id = ?1 AND credential_type = ?2",
        params![account.user_id, account.credential_type.as_str()],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Any user's paper credentials — used for account-agnostic broker calls
/// (market calendar, price fallback).
pub fn any_paper(conn: &Connection) -> Result<Option<CredentialRow>> {
    let user: Option<String> = conn
        .query_row(
            "SELECT user_id FROM broker_credentials WHERE credential_type = 'paper' LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match user {
        Some(user_id) => get(conn, &AccountKey::new(user_id, CredentialType::Paper)),
        None => Ok(None),
    }
}

fn split_pair(joined: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let Some((a, b)) = joined.split_once(':') else {
        bail!("expected two hex values joined by ':'");
    };
    Ok((hex::decode(a)?, hex::decode(b)?))
}

fn bad_len(col: &str) -> anyhow::Error {
    anyhow::anyhow!("{col} column has wrong length")
}
