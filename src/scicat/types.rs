use serde::{Deserialize, Serialize};

/// The caller as seen by SciCat
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub username: String,
    pub email: String,
    pub display_name: String,
    pub access_groups: Vec<String>,
}

/// `GET /users/my/self`
#[derive(Debug, Deserialize)]
pub(crate) struct SelfResponse {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct IdentityProfile {
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub access_groups: Vec<String>,
}

/// `GET /useridentities/findOne`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct UserIdentity {
    pub profile: IdentityProfile,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreatedDataset {
    pub pid: String,
}

/// One file of an original datablock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    pub path: String,
    pub size: u64,
    /// Modification time, RFC 3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

/// Body of `POST /OrigDatablocks`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrigDatablock {
    pub dataset_id: String,
    pub size: u64,
    pub data_file_list: Vec<DataFile>,
    pub owner_group: String,
    pub access_groups: Vec<String>,
}

/// Body of `POST /jobs` for an archive job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub owner_user: String,
    pub owner_group: String,
    pub contact_email: String,
    pub job_params: ArchiveJobParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveJobParams {
    pub dataset_list: Vec<JobDataset>,
    pub tape_copies: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobDataset {
    pub pid: String,
    pub files: Vec<String>,
}

impl ArchiveJobRequest {
    /// Archive job for a single dataset, all files, one tape copy
    pub fn single(user: &UserInfo, owner_group: &str, pid: &str) -> Self {
        Self {
            job_type: "archive".into(),
            owner_user: user.username.clone(),
            owner_group: owner_group.to_string(),
            contact_email: user.email.clone(),
            job_params: ArchiveJobParams {
                dataset_list: vec![JobDataset {
                    pid: pid.to_string(),
                    files: Vec::new(),
                }],
                tape_copies: 1,
            },
        }
    }
}
