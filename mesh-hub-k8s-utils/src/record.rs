use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{Error, Result};

/// Client for the records discovery produces. Every record lives in a single
/// namespace so objects are addressed by name alone.
///
/// `get` returns `Ok(None)` for a missing object, keeping not-found distinct
/// from a failed lookup.
#[async_trait]
pub trait RecordStore<K: Send + Sync + 'static>: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<K>>;

    /// Lists records carrying every label in `labels`.
    async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    async fn update(&self, obj: &K) -> Result<K>;

    /// Deleting a record that does not exist is not an error.
    async fn delete(&self, name: &str) -> Result<()>;

    async fn upsert(&self, obj: &K) -> Result<K>;
}

pub struct KubeRecordStore<K> {
    api: Api<K>,
    field_manager: String,
}

impl<K> KubeRecordStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    pub fn namespaced(client: Client, namespace: &str, field_manager: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            field_manager: field_manager.into(),
        }
    }
}

pub fn label_query(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn object_name<K: Resource>(obj: &K) -> Result<String> {
    obj.meta().name.clone().ok_or(Error::UnnamedObject)
}

#[async_trait]
impl<K> RecordStore<K> for KubeRecordStore<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default,
{
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if !labels.is_empty() {
            params = params.labels(&label_query(labels));
        }
        Ok(self.api.list(&params).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let mut obj = obj.clone();
        if obj.meta().resource_version.is_none()
            && let Some(current) = self.api.get_opt(&name).await?
        {
            obj.meta_mut().resource_version = current.meta().resource_version.clone();
        }
        Ok(self.api.replace(&name, &PostParams::default(), &obj).await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!("record {} already deleted", name);
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn upsert(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let mut obj = obj.clone();
        // SSA requires managedFields to be omitted from the payload.
        obj.meta_mut().managed_fields = None;
        obj.meta_mut().resource_version = None;
        let params = PatchParams::apply(&self.field_manager).force();
        Ok(self.api.patch(&name, &params, &Patch::Apply(&obj)).await?)
    }
}
