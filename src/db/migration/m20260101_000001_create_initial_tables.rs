//! Creates all eight relational stores in one migration — there is exactly
//! one schema generation so far.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
	async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.create_table(
				Table::create()
					.table(CacheRegistry::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(CacheRegistry::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(CacheRegistry::DeviceUid).big_integer().not_null())
					.col(ColumnDef::new(CacheRegistry::SubtreeRootUid).big_integer().not_null())
					.col(ColumnDef::new(CacheRegistry::SubtreeRootPath).string().not_null())
					.col(ColumnDef::new(CacheRegistry::CacheLocation).string().not_null())
					.col(
						ColumnDef::new(CacheRegistry::LastSyncTs)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(CacheRegistry::IsComplete).boolean().not_null())
					.to_owned(),
			)
			.await?;
		manager
			.create_index(
				Index::create()
					.name("idx_cache_registry_device_uid")
					.table(CacheRegistry::Table)
					.col(CacheRegistry::DeviceUid)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(LocalNodes::Table)
					.if_not_exists()
					.col(ColumnDef::new(LocalNodes::Uid).big_integer().not_null().primary_key())
					.col(ColumnDef::new(LocalNodes::DeviceUid).big_integer().not_null())
					.col(ColumnDef::new(LocalNodes::Path).string().not_null().unique_key())
					.col(ColumnDef::new(LocalNodes::IsDir).boolean().not_null())
					.col(ColumnDef::new(LocalNodes::Size).big_integer().not_null())
					.col(ColumnDef::new(LocalNodes::MtimeMs).big_integer().not_null())
					.col(ColumnDef::new(LocalNodes::CtimeMs).big_integer().not_null())
					.col(ColumnDef::new(LocalNodes::Md5).string())
					.col(ColumnDef::new(LocalNodes::Sha256).string())
					.col(ColumnDef::new(LocalNodes::FileCount).big_integer().not_null())
					.col(ColumnDef::new(LocalNodes::DirCount).big_integer().not_null())
					.col(ColumnDef::new(LocalNodes::Trashed).boolean().not_null())
					.col(
						ColumnDef::new(LocalNodes::SyncTs)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.to_owned(),
			)
			.await?;
		manager
			.create_index(
				Index::create()
					.name("idx_local_nodes_device_uid")
					.table(LocalNodes::Table)
					.col(LocalNodes::DeviceUid)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(RemoteNodes::Table)
					.if_not_exists()
					.col(ColumnDef::new(RemoteNodes::Uid).big_integer().not_null().primary_key())
					.col(ColumnDef::new(RemoteNodes::DeviceUid).big_integer().not_null())
					.col(ColumnDef::new(RemoteNodes::CloudId).string().not_null().unique_key())
					.col(ColumnDef::new(RemoteNodes::IsDir).boolean().not_null())
					.col(ColumnDef::new(RemoteNodes::Size).big_integer().not_null())
					.col(ColumnDef::new(RemoteNodes::MtimeMs).big_integer().not_null())
					.col(ColumnDef::new(RemoteNodes::CtimeMs).big_integer().not_null())
					.col(ColumnDef::new(RemoteNodes::Md5).string())
					.col(ColumnDef::new(RemoteNodes::Owner).string())
					.col(ColumnDef::new(RemoteNodes::Version).big_integer().not_null())
					.col(ColumnDef::new(RemoteNodes::HeadRevision).string())
					.col(ColumnDef::new(RemoteNodes::MyDrive).boolean().not_null())
					.col(ColumnDef::new(RemoteNodes::Shared).boolean().not_null())
					.col(ColumnDef::new(RemoteNodes::Trashed).boolean().not_null())
					.col(ColumnDef::new(RemoteNodes::ChildrenComplete).boolean().not_null())
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(RemoteParents::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(RemoteParents::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(RemoteParents::ChildUid).big_integer().not_null())
					.col(ColumnDef::new(RemoteParents::ParentUid).big_integer().not_null())
					.foreign_key(
						ForeignKey::create()
							.name("fk_remote_parents_child")
							.from(RemoteParents::Table, RemoteParents::ChildUid)
							.to(RemoteNodes::Table, RemoteNodes::Uid),
					)
					.to_owned(),
			)
			.await?;
		manager
			.create_index(
				Index::create()
					.name("idx_remote_parents_child_uid")
					.table(RemoteParents::Table)
					.col(RemoteParents::ChildUid)
					.to_owned(),
			)
			.await?;
		manager
			.create_index(
				Index::create()
					.name("idx_remote_parents_parent_uid")
					.table(RemoteParents::Table)
					.col(RemoteParents::ParentUid)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(PendingOps::Table)
					.if_not_exists()
					.col(ColumnDef::new(PendingOps::OpUid).uuid().not_null().primary_key())
					.col(ColumnDef::new(PendingOps::BatchUid).uuid().not_null())
					.col(ColumnDef::new(PendingOps::ParentOpUid).uuid())
					.col(ColumnDef::new(PendingOps::OpType).string().not_null())
					.col(ColumnDef::new(PendingOps::SrcDeviceUid).big_integer().not_null())
					.col(ColumnDef::new(PendingOps::SrcUid).big_integer().not_null())
					.col(ColumnDef::new(PendingOps::SrcPaths).json().not_null())
					.col(ColumnDef::new(PendingOps::DstDeviceUid).big_integer())
					.col(ColumnDef::new(PendingOps::DstUid).big_integer())
					.col(ColumnDef::new(PendingOps::DstPaths).json())
					.col(
						ColumnDef::new(PendingOps::CreateTs)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(PendingOps::Status).string().not_null())
					.col(
						ColumnDef::new(PendingOps::Recursive)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(ColumnDef::new(PendingOps::ToTrash).boolean().not_null().default(true))
					.to_owned(),
			)
			.await?;
		manager
			.create_index(
				Index::create()
					.name("idx_pending_ops_batch_uid")
					.table(PendingOps::Table)
					.col(PendingOps::BatchUid)
					.to_owned(),
			)
			.await?;
		manager
			.create_index(
				Index::create()
					.name("idx_pending_ops_status")
					.table(PendingOps::Table)
					.col(PendingOps::Status)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(ArchivedOps::Table)
					.if_not_exists()
					.col(ColumnDef::new(ArchivedOps::OpUid).uuid().not_null().primary_key())
					.col(ColumnDef::new(ArchivedOps::BatchUid).uuid().not_null())
					.col(ColumnDef::new(ArchivedOps::ParentOpUid).uuid())
					.col(ColumnDef::new(ArchivedOps::OpType).string().not_null())
					.col(ColumnDef::new(ArchivedOps::SrcDeviceUid).big_integer().not_null())
					.col(ColumnDef::new(ArchivedOps::SrcUid).big_integer().not_null())
					.col(ColumnDef::new(ArchivedOps::SrcPaths).json().not_null())
					.col(ColumnDef::new(ArchivedOps::DstDeviceUid).big_integer())
					.col(ColumnDef::new(ArchivedOps::DstUid).big_integer())
					.col(ColumnDef::new(ArchivedOps::DstPaths).json())
					.col(
						ColumnDef::new(ArchivedOps::CreateTs)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(ArchivedOps::Status).string().not_null())
					.col(
						ColumnDef::new(ArchivedOps::Recursive)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(ColumnDef::new(ArchivedOps::ToTrash).boolean().not_null().default(true))
					.col(
						ColumnDef::new(ArchivedOps::ArchivedTs)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(ArchivedOps::ArchivalReason).string().not_null())
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(UidPathMapping::Table)
					.if_not_exists()
					.col(ColumnDef::new(UidPathMapping::Path).string().not_null().primary_key())
					.col(ColumnDef::new(UidPathMapping::DeviceUid).big_integer().not_null())
					.col(ColumnDef::new(UidPathMapping::Uid).big_integer().not_null())
					.to_owned(),
			)
			.await?;
		manager
			.create_index(
				Index::create()
					.name("idx_uid_path_mapping_uid")
					.table(UidPathMapping::Table)
					.col(UidPathMapping::Uid)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(UidCloudIdMapping::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(UidCloudIdMapping::CloudId)
							.string()
							.not_null()
							.primary_key(),
					)
					.col(ColumnDef::new(UidCloudIdMapping::DeviceUid).big_integer().not_null())
					.col(ColumnDef::new(UidCloudIdMapping::Uid).big_integer().not_null())
					.to_owned(),
			)
			.await?;
		manager
			.create_index(
				Index::create()
					.name("idx_uid_cloud_id_mapping_uid")
					.table(UidCloudIdMapping::Table)
					.col(UidCloudIdMapping::Uid)
					.to_owned(),
			)
			.await?;

		Ok(())
	}

	async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.drop_table(Table::drop().table(UidCloudIdMapping::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(UidPathMapping::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(ArchivedOps::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(PendingOps::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(RemoteParents::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(RemoteNodes::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(LocalNodes::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(CacheRegistry::Table).to_owned())
			.await?;
		Ok(())
	}
}

#[derive(Iden)]
enum CacheRegistry {
	Table,
	Id,
	DeviceUid,
	SubtreeRootUid,
	SubtreeRootPath,
	CacheLocation,
	LastSyncTs,
	IsComplete,
}

#[derive(Iden)]
enum LocalNodes {
	Table,
	Uid,
	DeviceUid,
	Path,
	IsDir,
	Size,
	MtimeMs,
	CtimeMs,
	Md5,
	Sha256,
	FileCount,
	DirCount,
	Trashed,
	SyncTs,
}

#[derive(Iden)]
enum RemoteNodes {
	Table,
	Uid,
	DeviceUid,
	CloudId,
	IsDir,
	Size,
	MtimeMs,
	CtimeMs,
	Md5,
	Owner,
	Version,
	HeadRevision,
	MyDrive,
	Shared,
	Trashed,
	ChildrenComplete,
}

#[derive(Iden)]
enum RemoteParents {
	Table,
	Id,
	ChildUid,
	ParentUid,
}

#[derive(Iden)]
enum PendingOps {
	Table,
	OpUid,
	BatchUid,
	ParentOpUid,
	OpType,
	SrcDeviceUid,
	SrcUid,
	SrcPaths,
	DstDeviceUid,
	DstUid,
	DstPaths,
	CreateTs,
	Status,
	Recursive,
	ToTrash,
}

#[derive(Iden)]
enum ArchivedOps {
	Table,
	OpUid,
	BatchUid,
	ParentOpUid,
	OpType,
	SrcDeviceUid,
	SrcUid,
	SrcPaths,
	DstDeviceUid,
	DstUid,
	DstPaths,
	CreateTs,
	Status,
	Recursive,
	ToTrash,
	ArchivedTs,
	ArchivalReason,
}

#[derive(Iden)]
enum UidPathMapping {
	Table,
	Path,
	DeviceUid,
	Uid,
}

#[derive(Iden)]
enum UidCloudIdMapping {
	Table,
	CloudId,
	DeviceUid,
	Uid,
}
