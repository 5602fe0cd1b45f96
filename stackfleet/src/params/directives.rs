//! Placeholder directive syntax.
//!
//! A directive is written `$[<scope>_<name>[_<args>]]`, case-insensitive.
//! The scope is conventionally `taskcat` but any word is accepted.
//! Directives are evaluated in [`Directive::ORDER`]; several patterns are
//! substrings of others, so the order is part of the contract.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

macro_rules! directive_regex {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($pattern).expect("invalid directive regex"));
    };
}

directive_regex!(RANDOM_NUMBERS, r"(?i)\$\[\w+_random-numbers\]");
directive_regex!(RANDOM_STRING, r"(?i)\$\[\w+_random-string\]");
directive_regex!(AUTOBUCKET, r"(?i)\$\[\w+_autobucket\]");
directive_regex!(AUTOBUCKET_PREFIX, r"(?i)\$\[\w+_autobucket_prefix\]");
directive_regex!(PASSWORD, r"(?i)\$\[\w+_genpass_(\d{1,2})([a-z])?\]");
directive_regex!(AZ_LIST, r"(?i)\$\[\w+_ge[nt]az_(\d{1,2})\]");
directive_regex!(SINGLE_AZ, r"(?i)\$\[\w+_ge[nt]singleaz_(\d{1,2})\]");
directive_regex!(KEY_PAIR, r"(?i)\$\[\w+_getkeypair\]");
directive_regex!(LICENSE_BUCKET, r"(?i)\$\[\w+_getlicensebucket\]");
directive_regex!(MEDIA_BUCKET, r"(?i)\$\[\w+_getmediabucket\]");
directive_regex!(LICENSE_CONTENT, r"(?i)\$\[\w+_getlicensecontent\](.*)$");
directive_regex!(PRESIGNED_URL, r"(?i)\$\[\w+_presignedurl\](.*)$");
directive_regex!(SSM, r"(?i)\$\[\w+_ssm_([\w/\-.:]+)\]");
directive_regex!(SECRETS_MANAGER, r"(?i)\$\[\w+_secretsmanager_([\w/\-.:+=@]+)\]");
directive_regex!(GET_VAL, r"(?i)\$\[\w+_getval_(\w+)\]$");
directive_regex!(UUID, r"(?i)\$\[\w+_gen[gu]uid\]");
directive_regex!(CURRENT_REGION, r"(?i)\$\[\w+_current_region\]");
directive_regex!(PROJECT_NAME, r"(?i)\$\[\w+_project_name\]");
directive_regex!(TEST_NAME, r"(?i)\$\[\w+_test_name\]");

/// How a directive's result is spliced into the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Splice {
    /// Every occurrence of the token is replaced.
    Token,
    /// The whole parameter value is replaced.
    WholeValue,
}

/// One kind of placeholder directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Directive {
    /// 20 random digits.
    RandomNumbers,
    /// 20 random lowercase letters.
    RandomString,
    /// The staging bucket name.
    AutoBucket,
    /// The key prefix under which the project is staged.
    AutoBucketPrefix,
    /// Generated password; args are length and optional type.
    Password,
    /// Comma-joined list of N available zones.
    AzList,
    /// One zone by 0-based ordinal.
    SingleAz,
    /// Fixed key pair name.
    KeyPair,
    /// License bucket placeholder.
    LicenseBucket,
    /// Media bucket placeholder.
    MediaBucket,
    /// Trimmed object content.
    LicenseContent,
    /// Presigned GET url.
    PresignedUrl,
    /// Parameter store lookup.
    Ssm,
    /// Secret store lookup.
    SecretsManager,
    /// Back-reference to an earlier parameter.
    GetVal,
    /// Random UUID.
    Uuid,
    /// The region being rendered for.
    CurrentRegion,
    /// The project name.
    ProjectName,
    /// The test name.
    TestName,
}

impl Directive {
    /// Evaluation order.
    pub const ORDER: [Self; 19] = [
        Self::RandomNumbers,
        Self::RandomString,
        Self::AutoBucket,
        Self::AutoBucketPrefix,
        Self::Password,
        Self::AzList,
        Self::SingleAz,
        Self::KeyPair,
        Self::LicenseBucket,
        Self::MediaBucket,
        Self::LicenseContent,
        Self::PresignedUrl,
        Self::Ssm,
        Self::SecretsManager,
        Self::GetVal,
        Self::Uuid,
        Self::CurrentRegion,
        Self::ProjectName,
        Self::TestName,
    ];

    /// The compiled pattern.
    #[must_use]
    pub fn pattern(self) -> &'static Regex {
        match self {
            Self::RandomNumbers => &RANDOM_NUMBERS,
            Self::RandomString => &RANDOM_STRING,
            Self::AutoBucket => &AUTOBUCKET,
            Self::AutoBucketPrefix => &AUTOBUCKET_PREFIX,
            Self::Password => &PASSWORD,
            Self::AzList => &AZ_LIST,
            Self::SingleAz => &SINGLE_AZ,
            Self::KeyPair => &KEY_PAIR,
            Self::LicenseBucket => &LICENSE_BUCKET,
            Self::MediaBucket => &MEDIA_BUCKET,
            Self::LicenseContent => &LICENSE_CONTENT,
            Self::PresignedUrl => &PRESIGNED_URL,
            Self::Ssm => &SSM,
            Self::SecretsManager => &SECRETS_MANAGER,
            Self::GetVal => &GET_VAL,
            Self::Uuid => &UUID,
            Self::CurrentRegion => &CURRENT_REGION,
            Self::ProjectName => &PROJECT_NAME,
            Self::TestName => &TEST_NAME,
        }
    }

    /// How the result is spliced into the value.
    #[must_use]
    pub fn splice(self) -> Splice {
        match self {
            Self::LicenseContent | Self::PresignedUrl | Self::GetVal => Splice::WholeValue,
            _ => Splice::Token,
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RandomNumbers => "random-numbers",
            Self::RandomString => "random-string",
            Self::AutoBucket => "autobucket",
            Self::AutoBucketPrefix => "autobucket_prefix",
            Self::Password => "genpass",
            Self::AzList => "genaz",
            Self::SingleAz => "gensingleaz",
            Self::KeyPair => "getkeypair",
            Self::LicenseBucket => "getlicensebucket",
            Self::MediaBucket => "getmediabucket",
            Self::LicenseContent => "getlicensecontent",
            Self::PresignedUrl => "presignedurl",
            Self::Ssm => "ssm",
            Self::SecretsManager => "secretsmanager",
            Self::GetVal => "getval",
            Self::Uuid => "genuuid",
            Self::CurrentRegion => "current_region",
            Self::ProjectName => "project_name",
            Self::TestName => "test_name",
        };
        write!(f, "{name}")
    }
}
