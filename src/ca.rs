use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{Context, bail};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};

const ROOT_CA_COMMON_NAME: &str = "httplock Local Root CA";
const LEAF_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafCertMaterial {
    pub hostname: String,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

struct CachedLeaf {
    material: Arc<LeafCertMaterial>,
    issued_at: Instant,
}

/// Local MITM root CA plus a per-host leaf certificate cache. Leafs are
/// reissued after the 7-day cache entry ages out.
pub struct Ca {
    cert_pem: String,
    issuer: Issuer<'static, KeyPair>,
    cache: Mutex<HashMap<String, CachedLeaf>>,
}

impl Ca {
    /// Generates a fresh self-signed root CA held in memory for the lifetime
    /// of the process.
    pub fn generate() -> anyhow::Result<Self> {
        let mut params = CertificateParams::new(Vec::new())
            .context("initialize root CA certificate parameters")?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, ROOT_CA_COMMON_NAME);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];

        let key_pair = KeyPair::generate().context("generate root CA private key")?;
        let cert = params
            .self_signed(&key_pair)
            .context("self-sign root CA certificate")?;
        let cert_pem = cert.pem();

        let issuer = Issuer::new(params, key_pair);
        Ok(Self {
            cert_pem,
            issuer,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// The root certificate in PEM form, as served by `GET /api/ca`.
    pub fn ca_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Returns the cached leaf for a hostname, minting a new one when absent
    /// or older than the cache lifetime.
    pub fn issue_for_host(&self, hostname: &str) -> anyhow::Result<Arc<LeafCertMaterial>> {
        let host = canonical_host(hostname)?;

        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = cache.get(&host) {
            if existing.issued_at.elapsed() < LEAF_CACHE_TTL {
                return Ok(Arc::clone(&existing.material));
            }
        }

        let mut params = CertificateParams::new(vec![host.clone()])
            .with_context(|| format!("initialize leaf certificate parameters for `{host}`"))?;
        params.distinguished_name.push(DnType::CommonName, host.clone());
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;

        let leaf_key =
            KeyPair::generate().with_context(|| format!("generate leaf key for `{host}`"))?;
        let cert = params
            .signed_by(&leaf_key, &self.issuer)
            .with_context(|| format!("sign leaf certificate for `{host}`"))?;

        let material = Arc::new(LeafCertMaterial {
            hostname: host.clone(),
            cert_der: cert.der().to_vec(),
            key_der: leaf_key.serialize_der(),
        });
        cache.insert(
            host,
            CachedLeaf {
                material: Arc::clone(&material),
                issued_at: Instant::now(),
            },
        );
        Ok(material)
    }

    #[cfg(test)]
    fn age_cache_entries(&self, by: Duration) {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for entry in cache.values_mut() {
            if let Some(backdated) = entry.issued_at.checked_sub(by) {
                entry.issued_at = backdated;
            }
        }
    }
}

/// CONNECT authorities may bracket IPv6 literals or carry a fully-qualified
/// trailing dot; leaf cache entries key on the bare lowercase host.
fn canonical_host(raw: &str) -> anyhow::Result<String> {
    let mut host = raw.trim();
    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        host = inner;
    }
    host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() {
        bail!("cannot issue a leaf certificate for an empty hostname");
    }
    Ok(host.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::Ca;
    use x509_parser::{extensions::GeneralName, parse_x509_certificate, pem::parse_x509_pem};

    #[test]
    fn generated_ca_is_pem_encoded_and_self_signed() {
        let ca = Ca::generate().expect("CA generation should succeed");
        let pem = ca.ca_pem();
        assert!(pem.contains("BEGIN CERTIFICATE"), "pem: {pem}");

        let (_, pem_block) = parse_x509_pem(pem.as_bytes()).expect("CA PEM should parse");
        let (_, certificate) =
            parse_x509_certificate(&pem_block.contents).expect("CA DER should parse");
        assert!(certificate.is_ca(), "certificate should be a CA");
        assert_eq!(certificate.issuer(), certificate.subject());
    }

    #[test]
    fn leaf_sets_cn_and_san_for_hostname() {
        let ca = Ca::generate().expect("CA generation should succeed");
        let leaf = ca
            .issue_for_host("Api.Example.Test")
            .expect("leaf issuance should succeed");

        let (_, certificate) =
            parse_x509_certificate(&leaf.cert_der).expect("leaf DER should parse");

        let cn_values: Result<Vec<_>, _> = certificate
            .subject()
            .iter_common_name()
            .map(|attr| attr.as_str())
            .collect();
        assert_eq!(
            cn_values.expect("CN should decode"),
            vec!["api.example.test"]
        );

        let san = certificate
            .subject_alternative_name()
            .expect("SAN extension lookup should succeed")
            .expect("SAN extension should exist");
        let has_matching_san = san.value.general_names.iter().any(|name| {
            matches!(
                name,
                GeneralName::DNSName(value) if *value == "api.example.test"
            )
        });
        assert!(
            has_matching_san,
            "leaf SAN should include requested host: {:?}",
            san.value.general_names
        );
    }

    #[test]
    fn leaf_cache_returns_the_same_material_by_normalized_hostname() {
        let ca = Ca::generate().expect("CA generation should succeed");
        let first = ca
            .issue_for_host("API.EXAMPLE.TEST")
            .expect("first issuance should succeed");
        let second = ca
            .issue_for_host("api.example.test")
            .expect("second issuance should succeed");

        assert!(
            Arc::ptr_eq(&first, &second),
            "cache should return the same in-memory leaf material"
        );
    }

    #[test]
    fn aged_out_cache_entries_are_reissued() {
        let ca = Ca::generate().expect("CA generation should succeed");
        let first = ca
            .issue_for_host("example.test")
            .expect("first issuance should succeed");
        ca.age_cache_entries(Duration::from_secs(8 * 24 * 60 * 60));
        let second = ca
            .issue_for_host("example.test")
            .expect("reissue should succeed");
        assert!(
            !Arc::ptr_eq(&first, &second),
            "expired leaf should be reissued"
        );
    }

    #[test]
    fn empty_hostname_is_rejected() {
        let ca = Ca::generate().expect("CA generation should succeed");
        let err = ca
            .issue_for_host("   ")
            .expect_err("empty hostname should fail");
        assert!(
            err.to_string().contains("empty hostname"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn bracketed_and_dot_suffixed_hostnames_normalize() {
        let ca = Ca::generate().expect("CA generation should succeed");
        let leaf = ca
            .issue_for_host("[2001:db8::1]")
            .expect("bracketed hostname should issue");
        assert_eq!(leaf.hostname, "2001:db8::1");

        let leaf = ca
            .issue_for_host("example.test.")
            .expect("dot-suffixed hostname should issue");
        assert_eq!(leaf.hostname, "example.test");
    }
}
