use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};

/// PEM files of one issued certificate.
#[derive(Clone, Debug)]
pub struct CertFiles {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

/// A throwaway certificate authority. Every certificate it issues is valid for `localhost`.
pub struct Pki {
    dir: PathBuf,
    ca: Certificate,
    ca_key: KeyPair,
    pub ca_path: PathBuf,
}

impl Pki {
    pub fn new(dir: &Path) -> Result<Self> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params
            .distinguished_name
            .push(DnType::CommonName, "MIFS Test CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_key = KeyPair::generate()?;
        let ca = params.self_signed(&ca_key)?;

        let ca_path = dir.join("ca.pem");
        fs::write(&ca_path, ca.pem())?;

        Ok(Self {
            dir: dir.to_path_buf(),
            ca,
            ca_key,
            ca_path,
        })
    }

    fn issue(&self, common_name: &str, purpose: ExtendedKeyUsagePurpose) -> Result<CertFiles> {
        let mut params = CertificateParams::new(vec!["localhost".to_string()])?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![purpose];

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.ca, &self.ca_key)?;

        let files = CertFiles {
            certificate: self.dir.join(format!("{}.crt.pem", common_name)),
            private_key: self.dir.join(format!("{}.key.pem", common_name)),
        };
        fs::write(&files.certificate, cert.pem())?;
        fs::write(&files.private_key, key.serialize_pem())?;
        Ok(files)
    }

    pub fn server_cert(&self, common_name: &str) -> Result<CertFiles> {
        self.issue(common_name, ExtendedKeyUsagePurpose::ServerAuth)
    }

    pub fn client_cert(&self, common_name: &str) -> Result<CertFiles> {
        self.issue(common_name, ExtendedKeyUsagePurpose::ClientAuth)
    }
}
