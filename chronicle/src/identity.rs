//! Users, refresh sessions and access tokens.
//!
//! Passwords are hashed with scrypt. Refresh and verification tokens are
//! high-entropy random strings; only their SHA-256 digests are stored.
//! Access tokens are short-lived signed JWTs whose `jti` can be revoked
//! ahead of their natural expiry.
use jsonwebtoken as jwt;
use localtime::LocalDuration;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlite as sql;
use thiserror::Error;

use crate::common::{self, Timestamp};
use crate::db::{opt_int, transaction, Database};

/// Identifier for users.
pub type UserId = String;

/// How long access tokens live.
pub const ACCESS_TOKEN_LIFETIME: LocalDuration = LocalDuration::from_mins(15);
/// How long refresh sessions live.
pub const REFRESH_SESSION_LIFETIME: LocalDuration = LocalDuration::from_mins(30 * 24 * 60);
/// How long e-mail verification tokens live.
pub const VERIFICATION_TOKEN_LIFETIME: LocalDuration = LocalDuration::from_mins(24 * 60);
/// How long password-reset tokens live.
pub const RESET_TOKEN_LIFETIME: LocalDuration = LocalDuration::from_mins(60);

/// Failed logins tolerated within [`LOGIN_BACKOFF_WINDOW`] before rate limiting.
const LOGIN_ATTEMPT_LIMIT: i64 = 10;
const LOGIN_BACKOFF_WINDOW: LocalDuration = LocalDuration::from_mins(15);

const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

#[derive(Error, Debug)]
pub enum Error {
    /// An internal error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    /// Token signing or verification failed.
    #[error("token error: {0}")]
    Jwt(#[from] jwt::errors::Error),
    /// The e-mail or password did not match.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// The account's e-mail address has not been verified.
    #[error("e-mail address is not verified")]
    UnverifiedEmail,
    /// The presented token has expired.
    #[error("token expired")]
    TokenExpired,
    /// The presented token was revoked.
    #[error("token revoked")]
    TokenRevoked,
    /// Too many failed attempts; try again later.
    #[error("rate limited")]
    RateLimited,
    /// The e-mail address is already registered.
    #[error("e-mail address `{0}` is already registered")]
    EmailTaken(String),
    /// User not found.
    #[error("user `{0}` not found")]
    NotFound(String),
}

/// A user account. Never hard-deleted, only deactivated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub email: String,
    pub email_verified: bool,
    pub role: String,
    pub is_external: bool,
    pub external_space_id: Option<String>,
    pub external_expires_at: Option<Timestamp>,
    pub deactivated_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl User {
    /// Whether this principal may see internal-only deliberation.
    pub fn is_internal(&self) -> bool {
        !self.is_external
    }
}

/// Claims carried by an access token.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    /// User id.
    pub sub: UserId,
    pub name: String,
    pub role: String,
    pub is_external: bool,
    pub jti: String,
    /// Expiry, unix time in seconds.
    pub exp: i64,
}

/// An access/refresh token pair returned on login and refresh.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Signs and verifies access tokens.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: jwt::EncodingKey,
    decoding: jwt::DecodingKey,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: jwt::EncodingKey::from_secret(secret),
            decoding: jwt::DecodingKey::from_secret(secret),
        }
    }

    /// Sign access-token claims for the given user.
    pub fn sign(&self, user: &User) -> Result<(String, Claims), Error> {
        let exp = Timestamp::now() + ACCESS_TOKEN_LIFETIME;
        let claims = Claims {
            sub: user.id.clone(),
            name: user.display_name.clone(),
            role: user.role.clone(),
            is_external: user.is_external,
            jti: common::id(),
            exp: (exp.as_millis() / 1000) as i64,
        };
        let token = jwt::encode(&jwt::Header::default(), &claims, &self.encoding)?;

        Ok((token, claims))
    }

    /// Verify a token's signature and expiry, returning its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, Error> {
        let mut validation = jwt::Validation::default();
        validation.validate_exp = true;

        let data = jwt::decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            if matches!(e.kind(), jwt::errors::ErrorKind::ExpiredSignature) {
                Error::TokenExpired
            } else {
                Error::Jwt(e)
            }
        })?;

        Ok(data.claims)
    }
}

/// Hash a password with scrypt and a fresh random salt.
pub fn hash_password(password: &str) -> String {
    let mut rng = fastrand::Rng::new();
    let salt: Vec<u8> = std::iter::repeat_with(|| rng.u8(..)).take(16).collect();
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32)
        .expect("scrypt parameters are valid");
    let mut output = [0u8; 32];
    scrypt::scrypt(password.as_bytes(), &salt, &params, &mut output)
        .expect("scrypt output length is valid");

    format!(
        "scrypt${SCRYPT_LOG_N}${SCRYPT_R}${SCRYPT_P}${}${}",
        hex::encode(salt),
        hex::encode(output)
    )
}

/// Verify a password against a stored hash string.
pub fn verify_password(stored: &str, password: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some("scrypt"), Some(log_n), Some(r), Some(p), Some(salt), Some(hash)) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    let (Ok(log_n), Ok(r), Ok(p)) = (log_n.parse(), r.parse(), p.parse()) else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (hex::decode(salt), hex::decode(hash)) else {
        return false;
    };
    let Ok(params) = scrypt::Params::new(log_n, r, p, hash.len()) else {
        return false;
    };
    let mut output = vec![0u8; hash.len()];
    if scrypt::scrypt(password.as_bytes(), &salt, &params, &mut output).is_err() {
        return false;
    }
    // Constant-time comparison.
    output
        .iter()
        .zip(hash.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// SHA-256 digest of a token, hex-encoded. Stored in place of the token.
pub fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// User account store.
#[derive(Clone)]
pub struct Users {
    db: Database,
}

impl Users {
    pub fn open(db: Database) -> Self {
        Self { db }
    }

    /// Register a new user.
    ///
    /// Returns the user together with the e-mail verification token to be
    /// delivered out of band. The token itself is stored only as a digest.
    pub fn signup(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<(User, String), Error> {
        let now = Timestamp::now();
        let id = common::id();
        let verification = common::token();
        let password_hash = hash_password(password);

        transaction(&self.db, |conn| {
            if query::by_email(conn, email)?.is_some() {
                return Err(Error::EmailTaken(email.to_owned()));
            }
            let mut stmt = conn.prepare(
                "INSERT INTO users (id, display_name, email, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            stmt.bind((1, id.as_str()))?;
            stmt.bind((2, display_name))?;
            stmt.bind((3, email))?;
            stmt.bind((4, password_hash.as_str()))?;
            stmt.bind((5, now.as_millis() as i64))?;
            stmt.next()?;

            query::insert_verification(
                conn,
                &digest(&verification),
                &id,
                "email",
                now + VERIFICATION_TOKEN_LIFETIME,
            )?;

            Ok(())
        })?;

        let user = self.get(&id)?;

        Ok((user, verification))
    }

    /// Create an external guest, scoped to a single space.
    pub fn invite_guest(
        &self,
        email: &str,
        display_name: &str,
        space_id: &str,
        expires_at: Option<Timestamp>,
    ) -> Result<User, Error> {
        let now = Timestamp::now();
        let id = common::id();

        transaction(&self.db, |conn| {
            if query::by_email(conn, email)?.is_some() {
                return Err(Error::EmailTaken(email.to_owned()));
            }
            let mut stmt = conn.prepare(
                "INSERT INTO users (id, display_name, email, email_verified, role, is_external,
                                    external_space_id, external_expires_at, created_at)
                 VALUES (?1, ?2, ?3, 1, 'guest', 1, ?4, ?5, ?6)",
            )?;
            stmt.bind((1, id.as_str()))?;
            stmt.bind((2, display_name))?;
            stmt.bind((3, email))?;
            stmt.bind((4, space_id))?;
            stmt.bind((5, opt_int(expires_at.map(|t| t.as_millis() as i64))))?;
            stmt.bind((6, now.as_millis() as i64))?;
            stmt.next()?;

            Ok(())
        })?;

        self.get(&id)
    }

    /// Verify an e-mail address. The token is valid once, within its window.
    pub fn verify_email(&self, token: &str) -> Result<User, Error> {
        let now = Timestamp::now();
        let hash = digest(token);

        let user_id = transaction(&self.db, |conn| {
            let user_id = query::consume_verification(conn, &hash, "email", now)?;
            let mut stmt = conn.prepare("UPDATE users SET email_verified = 1 WHERE id = ?1")?;
            stmt.bind((1, user_id.as_str()))?;
            stmt.next()?;

            Ok::<_, Error>(user_id)
        })?;

        self.get(&user_id)
    }

    /// Authenticate with e-mail and password, returning a token pair.
    pub fn login(
        &self,
        email: &str,
        password: &str,
        signer: &TokenSigner,
    ) -> Result<(User, TokenPair), Error> {
        let now = Timestamp::now();
        let user = query::by_email(&self.db, email)?.ok_or(Error::InvalidCredentials)?;

        if user.deactivated_at.is_some() {
            return Err(Error::InvalidCredentials);
        }
        let (failed, last) = query::login_failures(&self.db, &user.id)?;
        if failed >= LOGIN_ATTEMPT_LIMIT
            && last.is_some_and(|t| now - t < LOGIN_BACKOFF_WINDOW)
        {
            return Err(Error::RateLimited);
        }
        let stored = query::password_hash(&self.db, &user.id)?;
        if !stored.is_some_and(|h| verify_password(&h, password)) {
            query::record_login_failure(&self.db, &user.id, now)?;
            return Err(Error::InvalidCredentials);
        }
        if !user.email_verified {
            return Err(Error::UnverifiedEmail);
        }
        query::clear_login_failures(&self.db, &user.id)?;

        let pair = self.issue_tokens(&user, signer)?;

        Ok((user, pair))
    }

    /// Rotate a refresh token.
    ///
    /// The old token is revoked on success. Presenting an already-revoked
    /// token is treated as theft: every refresh session of that user is
    /// invalidated.
    pub fn refresh(&self, refresh_token: &str, signer: &TokenSigner) -> Result<TokenPair, Error> {
        let now = Timestamp::now();
        let hash = digest(refresh_token);

        let session = query::refresh_session(&self.db, &hash)?.ok_or(Error::InvalidCredentials)?;
        if session.revoked_at.is_some() {
            // Reuse of a rotated token reads as theft. The blanket
            // revocation is committed on its own, so it sticks even though
            // this call fails.
            transaction(&self.db, |conn| {
                query::revoke_all_sessions(conn, &session.user_id, now)
            })?;
            return Err(Error::TokenRevoked);
        }
        if session.expires_at < now {
            return Err(Error::TokenExpired);
        }

        let user = self.get(&session.user_id)?;
        if user.deactivated_at.is_some() {
            return Err(Error::InvalidCredentials);
        }

        let rotated = common::token();
        let (access_token, _) = signer.sign(&user)?;
        transaction(&self.db, |conn| {
            query::revoke_session(conn, &hash, now)?;
            query::insert_session(conn, &digest(&rotated), &user.id, now)
        })?;

        Ok(TokenPair {
            access_token,
            refresh_token: rotated,
        })
    }

    /// Revoke a refresh session.
    pub fn logout(&self, refresh_token: &str) -> Result<(), Error> {
        let now = Timestamp::now();
        query::revoke_session(&self.db, &digest(refresh_token), now)?;

        Ok(())
    }

    /// Mark a short-lived access token id as invalid until its natural expiry.
    pub fn revoke_access(&self, jti: &str, expires_at: Timestamp) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "INSERT INTO revoked_tokens (jti, expires_at) VALUES (?1, ?2)
             ON CONFLICT DO NOTHING",
        )?;
        stmt.bind((1, jti))?;
        stmt.bind((2, expires_at.as_millis() as i64))?;
        stmt.next()?;

        Ok(())
    }

    /// Whether an access token id has been revoked.
    pub fn is_revoked(&self, jti: &str) -> Result<bool, Error> {
        let now = Timestamp::now();
        let mut stmt = self
            .db
            .prepare("SELECT 1 FROM revoked_tokens WHERE jti = ?1 AND expires_at >= ?2")?;
        stmt.bind((1, jti))?;
        stmt.bind((2, now.as_millis() as i64))?;

        Ok(stmt.into_iter().next().transpose()?.is_some())
    }

    /// Drop revocation entries past their natural expiry.
    pub fn expunge_revoked(&self) -> Result<(), Error> {
        let now = Timestamp::now();
        let mut stmt = self
            .db
            .prepare("DELETE FROM revoked_tokens WHERE expires_at < ?1")?;
        stmt.bind((1, now.as_millis() as i64))?;
        stmt.next()?;

        Ok(())
    }

    /// Begin a password reset, returning the single-use token.
    pub fn request_password_reset(&self, email: &str) -> Result<String, Error> {
        let now = Timestamp::now();
        let user = query::by_email(&self.db, email)?.ok_or(Error::InvalidCredentials)?;
        let token = common::token();

        query::insert_verification(
            &self.db,
            &digest(&token),
            &user.id,
            "reset",
            now + RESET_TOKEN_LIFETIME,
        )?;

        Ok(token)
    }

    /// Complete a password reset. Revokes all refresh sessions.
    pub fn reset_password(&self, token: &str, password: &str) -> Result<(), Error> {
        let now = Timestamp::now();
        let hash = digest(token);
        let password_hash = hash_password(password);

        transaction(&self.db, |conn| {
            let user_id = query::consume_verification(conn, &hash, "reset", now)?;

            let mut stmt =
                conn.prepare("UPDATE users SET password_hash = ?2, failed_logins = 0 WHERE id = ?1")?;
            stmt.bind((1, user_id.as_str()))?;
            stmt.bind((2, password_hash.as_str()))?;
            stmt.next()?;

            query::revoke_all_sessions(conn, &user_id, now)?;

            Ok(())
        })
    }

    /// Soft-deactivate a user.
    pub fn deactivate(&self, id: &str) -> Result<(), Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let mut stmt = conn.prepare("UPDATE users SET deactivated_at = ?2 WHERE id = ?1")?;
            stmt.bind((1, id))?;
            stmt.bind((2, now.as_millis() as i64))?;
            stmt.next()?;
            if conn.change_count() == 0 {
                return Err(Error::NotFound(id.to_owned()));
            }
            query::revoke_all_sessions(conn, id, now)?;

            Ok(())
        })
    }

    /// Get a user by id.
    pub fn get(&self, id: &str) -> Result<User, Error> {
        query::by_id(&self.db, id)?.ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    /// Get a user by e-mail.
    pub fn get_by_email(&self, email: &str) -> Result<Option<User>, Error> {
        query::by_email(&self.db, email)
    }

    fn issue_tokens(&self, user: &User, signer: &TokenSigner) -> Result<TokenPair, Error> {
        let now = Timestamp::now();
        let refresh_token = common::token();
        let (access_token, _) = signer.sign(user)?;

        query::insert_session(&self.db, &digest(&refresh_token), &user.id, now)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }
}

struct RefreshSession {
    user_id: UserId,
    expires_at: Timestamp,
    revoked_at: Option<Timestamp>,
}

/// Helper SQL queries, shared with other modules within the crate.
pub(crate) mod query {
    use super::*;

    pub(crate) fn by_id(db: &sql::Connection, id: &str) -> Result<Option<User>, Error> {
        let mut stmt = db.prepare(&format!("{} WHERE id = ?1", SELECT_USER))?;
        stmt.bind((1, id))?;

        stmt.into_iter()
            .next()
            .transpose()?
            .map(|row| parse_user(&row))
            .transpose()
    }

    pub(crate) fn by_email(db: &sql::Connection, email: &str) -> Result<Option<User>, Error> {
        let mut stmt = db.prepare(&format!("{} WHERE email = ?1", SELECT_USER))?;
        stmt.bind((1, email))?;

        stmt.into_iter()
            .next()
            .transpose()?
            .map(|row| parse_user(&row))
            .transpose()
    }

    const SELECT_USER: &str = "SELECT id, display_name, email, email_verified, role, is_external,
                external_space_id, external_expires_at, deactivated_at, created_at
         FROM users";

    pub(crate) fn parse_user(row: &sql::Row) -> Result<User, Error> {
        Ok(User {
            id: row.read::<&str, _>("id").to_owned(),
            display_name: row.read::<&str, _>("display_name").to_owned(),
            email: row.read::<&str, _>("email").to_owned(),
            email_verified: row.read::<i64, _>("email_verified") != 0,
            role: row.read::<&str, _>("role").to_owned(),
            is_external: row.read::<i64, _>("is_external") != 0,
            external_space_id: row
                .read::<Option<&str>, _>("external_space_id")
                .map(|s| s.to_owned()),
            external_expires_at: row
                .read::<Option<i64>, _>("external_expires_at")
                .map(|t| Timestamp::from_millis(t as u128)),
            deactivated_at: row
                .read::<Option<i64>, _>("deactivated_at")
                .map(|t| Timestamp::from_millis(t as u128)),
            created_at: Timestamp::from_millis(row.read::<i64, _>("created_at") as u128),
        })
    }

    pub(super) fn password_hash(db: &sql::Connection, id: &str) -> Result<Option<String>, Error> {
        let mut stmt = db.prepare("SELECT password_hash FROM users WHERE id = ?1")?;
        stmt.bind((1, id))?;

        match stmt.into_iter().next().transpose()? {
            None => Ok(None),
            Some(row) => Ok(row
                .read::<Option<&str>, _>("password_hash")
                .map(|s| s.to_owned())),
        }
    }

    pub(super) fn login_failures(
        db: &sql::Connection,
        id: &str,
    ) -> Result<(i64, Option<Timestamp>), Error> {
        let mut stmt =
            db.prepare("SELECT failed_logins, last_failed_login FROM users WHERE id = ?1")?;
        stmt.bind((1, id))?;

        match stmt.into_iter().next().transpose()? {
            None => Ok((0, None)),
            Some(row) => Ok((
                row.read::<i64, _>("failed_logins"),
                row.read::<Option<i64>, _>("last_failed_login")
                    .map(|t| Timestamp::from_millis(t as u128)),
            )),
        }
    }

    pub(super) fn record_login_failure(
        db: &sql::Connection,
        id: &str,
        now: Timestamp,
    ) -> Result<(), Error> {
        let mut stmt = db.prepare(
            "UPDATE users SET failed_logins = failed_logins + 1, last_failed_login = ?2
             WHERE id = ?1",
        )?;
        stmt.bind((1, id))?;
        stmt.bind((2, now.as_millis() as i64))?;
        stmt.next()?;

        Ok(())
    }

    pub(super) fn clear_login_failures(db: &sql::Connection, id: &str) -> Result<(), Error> {
        let mut stmt =
            db.prepare("UPDATE users SET failed_logins = 0, last_failed_login = NULL WHERE id = ?1")?;
        stmt.bind((1, id))?;
        stmt.next()?;

        Ok(())
    }

    pub(super) fn insert_verification(
        db: &sql::Connection,
        token_hash: &str,
        user_id: &str,
        kind: &str,
        expires_at: Timestamp,
    ) -> Result<(), Error> {
        let mut stmt = db.prepare(
            "INSERT INTO verification_tokens (token_hash, user_id, kind, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        stmt.bind((1, token_hash))?;
        stmt.bind((2, user_id))?;
        stmt.bind((3, kind))?;
        stmt.bind((4, expires_at.as_millis() as i64))?;
        stmt.next()?;

        Ok(())
    }

    /// Validate and mark a verification token as used, returning its user.
    pub(super) fn consume_verification(
        db: &sql::Connection,
        token_hash: &str,
        kind: &str,
        now: Timestamp,
    ) -> Result<UserId, Error> {
        let mut stmt = db.prepare(
            "SELECT user_id, expires_at, used_at FROM verification_tokens
             WHERE token_hash = ?1 AND kind = ?2",
        )?;
        stmt.bind((1, token_hash))?;
        stmt.bind((2, kind))?;

        let row = stmt
            .into_iter()
            .next()
            .transpose()?
            .ok_or(Error::InvalidCredentials)?;
        if row.read::<Option<i64>, _>("used_at").is_some() {
            return Err(Error::TokenRevoked);
        }
        if (row.read::<i64, _>("expires_at") as u64) < now.as_millis() {
            return Err(Error::TokenExpired);
        }
        let user_id = row.read::<&str, _>("user_id").to_owned();

        let mut stmt =
            db.prepare("UPDATE verification_tokens SET used_at = ?2 WHERE token_hash = ?1")?;
        stmt.bind((1, token_hash))?;
        stmt.bind((2, now.as_millis() as i64))?;
        stmt.next()?;

        Ok(user_id)
    }

    pub(super) fn insert_session(
        db: &sql::Connection,
        token_hash: &str,
        user_id: &str,
        now: Timestamp,
    ) -> Result<(), Error> {
        let mut stmt = db.prepare(
            "INSERT INTO refresh_sessions (token_hash, user_id, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        stmt.bind((1, token_hash))?;
        stmt.bind((2, user_id))?;
        stmt.bind((3, (now + REFRESH_SESSION_LIFETIME).as_millis() as i64))?;
        stmt.bind((4, now.as_millis() as i64))?;
        stmt.next()?;

        Ok(())
    }

    pub(super) fn refresh_session(
        db: &sql::Connection,
        token_hash: &str,
    ) -> Result<Option<RefreshSession>, Error> {
        let mut stmt = db.prepare(
            "SELECT user_id, expires_at, revoked_at FROM refresh_sessions WHERE token_hash = ?1",
        )?;
        stmt.bind((1, token_hash))?;

        match stmt.into_iter().next().transpose()? {
            None => Ok(None),
            Some(row) => Ok(Some(RefreshSession {
                user_id: row.read::<&str, _>("user_id").to_owned(),
                expires_at: Timestamp::from_millis(row.read::<i64, _>("expires_at") as u128),
                revoked_at: row
                    .read::<Option<i64>, _>("revoked_at")
                    .map(|t| Timestamp::from_millis(t as u128)),
            })),
        }
    }

    pub(super) fn revoke_session(
        db: &sql::Connection,
        token_hash: &str,
        now: Timestamp,
    ) -> Result<(), Error> {
        let mut stmt = db.prepare(
            "UPDATE refresh_sessions SET revoked_at = ?2 WHERE token_hash = ?1 AND revoked_at IS NULL",
        )?;
        stmt.bind((1, token_hash))?;
        stmt.bind((2, now.as_millis() as i64))?;
        stmt.next()?;

        Ok(())
    }

    pub(super) fn revoke_all_sessions(
        db: &sql::Connection,
        user_id: &str,
        now: Timestamp,
    ) -> Result<(), Error> {
        let mut stmt = db.prepare(
            "UPDATE refresh_sessions SET revoked_at = ?2 WHERE user_id = ?1 AND revoked_at IS NULL",
        )?;
        stmt.bind((1, user_id))?;
        stmt.bind((2, now.as_millis() as i64))?;
        stmt.next()?;

        Ok(())
    }
}
