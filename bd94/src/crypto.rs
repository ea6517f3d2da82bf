//! Key-agreement primitives
//!
//! The engine consumes the five cyclic key-agreement operations through the
//! [`KeyAgreement`] trait and never interprets the values they produce.
//! [`EcKeyAgreement`] is the default implementation over any `generic-ec`
//! curve; enable one of the `curve-*` crate features to pick a curve.

use std::marker::PhantomData;

use digest::Digest;
use generic_ec::{Curve, Point, Scalar, SecretScalar};
use rand_core::{CryptoRng, RngCore};
use sha2::Sha256;
use thiserror::Error;

/// Domain separation for session-key derivation.
const KEY_DOMAIN: &[u8] = b"bd94 session key v1";

/// Cyclic group key-agreement primitives.
///
/// All values cross this boundary as opaque byte sequences. `derive_key` is
/// the only operation allowed to suspend; everything else must complete
/// synchronously.
#[allow(async_fn_in_trait)]
pub trait KeyAgreement {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fresh private scalar for one cycle.
    fn generate_ri(&mut self) -> Result<Vec<u8>, Self::Error>;

    /// Public Z value of the participant holding `r`.
    fn compute_zi(&mut self, r: &[u8]) -> Result<Vec<u8>, Self::Error>;

    /// Public X value, from the participant's own `r` and the Z values of
    /// its right and left neighbors in the cycle.
    fn compute_xi(
        &mut self,
        r: &[u8],
        z_right: &[u8],
        z_left: &[u8],
    ) -> Result<Vec<u8>, Self::Error>;

    /// Shared group secret, from the participant's own `r` and X value, its
    /// left neighbor's Z value, and the X values of every member in cycle
    /// order.
    fn compute_shared_secret(
        &mut self,
        r: &[u8],
        x_self: &[u8],
        z_left: &[u8],
        x_array: &[Vec<u8>],
    ) -> Result<Vec<u8>, Self::Error>;

    /// Symmetric key material from the shared secret.
    async fn derive_key(&mut self, secret: &[u8]) -> Result<Vec<u8>, Self::Error>;
}

/// Burmester-Desmedt primitives over an elliptic curve.
///
/// `r` is a big-endian scalar, Z and X values are compressed points, and the
/// session key is `D` over a domain-separation prefix and the compressed
/// shared point:
///
/// * `z_i = r_i G`
/// * `x_i = r_i (z_{i+1} - z_{i-1})`
/// * `K_i = n r_i z_{i-1} + (n-1) x_i + (n-2) x_{i+1} + … + x_{i+n-2}`
///
/// Every participant's `K_i` is the same point, `(r_1 r_2 + r_2 r_3 + … +
/// r_n r_1) G`.
pub struct EcKeyAgreement<E: Curve, R, D: Digest = Sha256> {
    rng: R,
    _curve: PhantomData<fn() -> (E, D)>,
}

impl<E: Curve, R, D: Digest> EcKeyAgreement<E, R, D>
where
    R: RngCore + CryptoRng,
{
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            _curve: PhantomData,
        }
    }
}

impl<E: Curve, R, D> KeyAgreement for EcKeyAgreement<E, R, D>
where
    R: RngCore + CryptoRng,
    D: Digest,
{
    type Error = AgreementError;

    fn generate_ri(&mut self) -> Result<Vec<u8>, Self::Error> {
        let r = SecretScalar::<E>::random(&mut self.rng);
        Ok(r.as_ref().to_be_bytes().as_bytes().to_vec())
    }

    fn compute_zi(&mut self, r: &[u8]) -> Result<Vec<u8>, Self::Error> {
        let r = decode_scalar::<E>(r)?;
        Ok(encode_point(&(Point::generator() * &r)))
    }

    fn compute_xi(
        &mut self,
        r: &[u8],
        z_right: &[u8],
        z_left: &[u8],
    ) -> Result<Vec<u8>, Self::Error> {
        let r = decode_scalar::<E>(r)?;
        let z_right = decode_point::<E>(z_right)?;
        let z_left = decode_point::<E>(z_left)?;
        Ok(encode_point(&((z_right - z_left) * &r)))
    }

    fn compute_shared_secret(
        &mut self,
        r: &[u8],
        x_self: &[u8],
        z_left: &[u8],
        x_array: &[Vec<u8>],
    ) -> Result<Vec<u8>, Self::Error> {
        let n = x_array.len();
        let i = x_array
            .iter()
            .position(|x| x.as_slice() == x_self)
            .ok_or(AgreementError::OwnXMissing)?;

        let r = decode_scalar::<E>(r)?;
        let z_left = decode_point::<E>(z_left)?;
        let xs = x_array
            .iter()
            .map(|x| decode_point::<E>(x))
            .collect::<Result<Vec<_>, _>>()?;

        let mut shared = z_left * &(small_scalar::<E>(n) * &r);
        for j in 0..n.saturating_sub(1) {
            shared = shared + xs[(i + j) % n] * &small_scalar::<E>(n - 1 - j);
        }
        Ok(encode_point(&shared))
    }

    async fn derive_key(&mut self, secret: &[u8]) -> Result<Vec<u8>, Self::Error> {
        Ok(D::new_with_prefix(KEY_DOMAIN)
            .chain_update(secret)
            .finalize()
            .to_vec())
    }
}

fn decode_scalar<E: Curve>(bytes: &[u8]) -> Result<Scalar<E>, AgreementError> {
    Scalar::from_be_bytes(bytes).map_err(AgreementError::InvalidScalar)
}

fn decode_point<E: Curve>(bytes: &[u8]) -> Result<Point<E>, AgreementError> {
    Point::from_bytes(bytes).map_err(AgreementError::InvalidPoint)
}

fn encode_point<E: Curve>(point: &Point<E>) -> Vec<u8> {
    point.to_bytes(true).as_bytes().to_vec()
}

// Scalar for the small multiplicities in the shared-secret sum; n is a
// membership count, so repeated addition is fine.
fn small_scalar<E: Curve>(k: usize) -> Scalar<E> {
    let mut scalar = Scalar::<E>::zero();
    for _ in 0..k {
        scalar = scalar + Scalar::one();
    }
    scalar
}

/// Error of the curve-backed primitives
#[derive(Debug, Error)]
pub enum AgreementError {
    #[error("scalar bytes are malformed")]
    InvalidScalar(#[source] generic_ec::errors::InvalidScalar),
    #[error("point bytes are malformed")]
    InvalidPoint(#[source] generic_ec::errors::InvalidPoint),
    #[error("own X value does not appear in the X array")]
    OwnXMissing,
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use generic_ec::curves::Secp256k1;
    use rand_core::OsRng;

    use super::*;

    type Agreement = EcKeyAgreement<Secp256k1, OsRng>;

    fn agreement() -> Agreement {
        EcKeyAgreement::new(OsRng)
    }

    #[test]
    fn all_parties_agree() {
        for n in [2usize, 3, 5] {
            let mut parties: Vec<_> = (0..n).map(|_| agreement()).collect();

            let rs: Vec<_> = parties
                .iter_mut()
                .map(|p| p.generate_ri().unwrap())
                .collect();
            let zs: Vec<_> = parties
                .iter_mut()
                .zip(&rs)
                .map(|(p, r)| p.compute_zi(r).unwrap())
                .collect();
            let xs: Vec<_> = (0..n)
                .map(|i| {
                    parties[i]
                        .compute_xi(&rs[i], &zs[(i + 1) % n], &zs[(n + i - 1) % n])
                        .unwrap()
                })
                .collect();
            let keys: Vec<_> = (0..n)
                .map(|i| {
                    let secret = parties[i]
                        .compute_shared_secret(&rs[i], &xs[i], &zs[(n + i - 1) % n], &xs)
                        .unwrap();
                    block_on(parties[i].derive_key(&secret)).unwrap()
                })
                .collect();

            assert!(
                keys.iter().all(|key| key == &keys[0]),
                "derived keys diverged for n = {n}",
            );
            assert_eq!(keys[0].len(), 32);
        }
    }

    #[test]
    fn distinct_cycles_yield_distinct_keys() {
        let mut party = agreement();
        let r1 = party.generate_ri().unwrap();
        let r2 = party.generate_ri().unwrap();
        assert_ne!(r1, r2);
        assert_ne!(party.compute_zi(&r1).unwrap(), party.compute_zi(&r2).unwrap());
    }

    #[test]
    fn malformed_point_is_rejected() {
        let mut party = agreement();
        let r = party.generate_ri().unwrap();
        let z = party.compute_zi(&r).unwrap();

        let err = party.compute_xi(&r, &[0xff; 7], &z).unwrap_err();
        assert!(matches!(err, AgreementError::InvalidPoint(_)));
    }

    #[test]
    fn foreign_x_value_is_rejected() {
        let mut party = agreement();
        let r = party.generate_ri().unwrap();
        let z = party.compute_zi(&r).unwrap();

        let err = party
            .compute_shared_secret(&r, b"not in the array", &z, &[z.clone()])
            .unwrap_err();
        assert!(matches!(err, AgreementError::OwnXMissing));
    }
}
