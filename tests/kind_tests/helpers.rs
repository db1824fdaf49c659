//! Shared setup for live API server tests

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, CustomResourceExt};

use azurecluster_controller::crd::{
    AzureCluster, AzureClusterSpec, NetworkSpec, SubnetRole, SubnetSpec, VnetSpec,
};

/// Namespace all live tests create their records in
pub const TEST_NAMESPACE: &str = "default";

/// Connect to the cluster and make sure the AzureCluster CRD is installed
pub async fn ensure_test_cluster() -> Result<Client, kube::Error> {
    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());

    let crd = AzureCluster::crd();
    match crds.create(&PostParams::default(), &crd).await {
        Ok(_) => {
            // Give the API server a moment to serve the new resource
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(e),
    }
    Ok(client)
}

/// A valid spec whose cloud resource names derive from `name`
pub fn sample_spec(name: &str) -> AzureClusterSpec {
    AzureClusterSpec {
        location: "westeurope".to_string(),
        resource_group: format!("{}-rg", name),
        network_spec: NetworkSpec {
            vnet: VnetSpec {
                name: format!("{}-vnet", name),
                cidr_block: "10.0.0.0/8".to_string(),
            },
            subnets: vec![SubnetSpec {
                name: format!("{}-node", name),
                role: SubnetRole::Node,
                cidr_block: "10.1.0.0/16".to_string(),
            }],
        },
        additional_tags: Default::default(),
    }
}

/// An AzureCluster adopted by a CAPI Cluster of the same name
pub fn owned_cluster(name: &str) -> AzureCluster {
    let mut cluster = AzureCluster::new(name, sample_spec(name));
    cluster.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    cluster.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "cluster.x-k8s.io/v1beta1".to_string(),
        kind: "Cluster".to_string(),
        name: name.to_string(),
        uid: format!("{}-uid", name),
        ..Default::default()
    }]);
    cluster
}

/// Remove a record left behind by a previous run, finalizers included
pub async fn cleanup_cluster(client: &Client, name: &str) {
    let api: Api<AzureCluster> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let patch = serde_json::json!({ "metadata": { "finalizers": null } });
    let _ = api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await;
    let _ = api.delete(name, &DeleteParams::default()).await;
}
