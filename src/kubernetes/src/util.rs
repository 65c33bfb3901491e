use std::fmt::Debug;

use json_patch::{PatchOperation, RemoveOperation, TestOperation};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Patch, PatchParams},
    core::ApiResource,
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;

use super::error::Error;

pub fn create_owner_reference<T: Resource<DynamicType = ()>>(owner: &T) -> OwnerReference {
    let res = ApiResource::erase::<T>(&());
    OwnerReference {
        name: owner.name_any(),
        api_version: res.api_version,
        kind: res.kind,
        uid: match &owner.meta().uid {
            Some(uid) => uid.clone(),
            None => "".to_string(),
        },
        block_owner_deletion: Some(true),
        controller: Some(true),
    }
}

/// Whether `res` is controlled by `owner`.
pub fn is_controlled_by<T: Resource<DynamicType = ()>, O: Resource<DynamicType = ()>>(
    res: &T,
    owner: &O,
) -> bool {
    let kind = ApiResource::erase::<O>(&()).kind;
    res.owner_references().iter().any(|r| {
        r.controller.unwrap_or(false) && r.kind.eq(&kind) && r.name.eq(&owner.name_any())
    })
}

pub fn get_namespace<T: Resource<DynamicType = ()>>(resource: &T) -> Result<String, Error> {
    resource.namespace().ok_or(Error::GetNamespace)
}

pub fn get_namespaced_name<T: Resource<DynamicType = ()>>(resource: &T) -> String {
    match resource.namespace() {
        Some(ns) => format!("{ns}/{}", resource.name_any()),
        None => resource.name_any(),
    }
}

pub fn is_deleting<T: Resource>(resource: &T) -> bool {
    resource.meta().deletion_timestamp.is_some()
}

/// Remove `finalizer` from `resource`. A resource not carrying it is returned untouched.
pub async fn remove_finalizer<T>(
    api: &Api<T>,
    resource: &T,
    finalizer: &str,
) -> Result<T, kube::Error>
where
    T: Resource + Clone + DeserializeOwned + Debug,
{
    let Some(index) = resource.finalizers().iter().position(|f| f.eq(finalizer)) else {
        return Ok(resource.clone());
    };
    let path = format!("/metadata/finalizers/{index}");
    let patch = json_patch::Patch(vec![
        PatchOperation::Test(TestOperation {
            path: path.clone(),
            value: finalizer.into(),
        }),
        PatchOperation::Remove(RemoveOperation { path }),
    ]);
    api.patch(
        &resource.name_any(),
        &PatchParams::default(),
        &Patch::<()>::Json(patch),
    )
    .await
}

pub fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

pub fn is_already_exists(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409 && ae.reason.eq("AlreadyExists"))
}

pub fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409 && !ae.reason.eq("AlreadyExists"))
}
