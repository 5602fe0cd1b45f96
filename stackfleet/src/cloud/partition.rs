//! Partition-dependent constants.

/// Region that hosts non-regional buckets for a partition.
#[must_use]
pub fn default_bucket_region(partition: &str) -> &'static str {
    match partition {
        "aws-us-gov" => "us-gov-east-1",
        "aws-cn" => "cn-north-1",
        _ => "us-east-1",
    }
}

/// DNS suffix for object storage endpoints in a partition.
#[must_use]
pub fn dns_suffix(partition: &str) -> &'static str {
    if partition == "aws-cn" {
        "amazonaws.com.cn"
    } else {
        "amazonaws.com"
    }
}

/// Virtual-hosted style URL of the bucket root, with a trailing slash.
#[must_use]
pub fn template_url_prefix(bucket: &str, region: &str, partition: &str) -> String {
    format!("https://{bucket}.s3.{region}.{}/", dns_suffix(partition))
}

/// Virtual-hosted style URL of one object.
#[must_use]
pub fn object_url(bucket: &str, region: &str, partition: &str, key: &str) -> String {
    format!(
        "{}{}",
        template_url_prefix(bucket, region, partition),
        key.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bucket_region() {
        assert_eq!(default_bucket_region("aws"), "us-east-1");
        assert_eq!(default_bucket_region("aws-us-gov"), "us-gov-east-1");
        assert_eq!(default_bucket_region("aws-cn"), "cn-north-1");
    }

    #[test]
    fn test_object_url_china() {
        assert_eq!(
            object_url("b", "cn-north-1", "aws-cn", "proj/templates/a.yaml"),
            "https://b.s3.cn-north-1.amazonaws.com.cn/proj/templates/a.yaml"
        );
    }

    #[test]
    fn test_object_url_strips_leading_slash() {
        assert_eq!(
            object_url("b", "eu-west-1", "aws", "/k"),
            "https://b.s3.eu-west-1.amazonaws.com/k"
        );
    }
}
